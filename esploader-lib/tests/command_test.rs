mod common;

use common::FakeEsp;
use esploader_lib::command::{
    self, CommandResult, DEFAULT_TIMEOUT, Opcode, ResponsePacket, build_request, checksum,
    timeout_per_mb,
};
use esploader_lib::connection::{Connection, MAX_READ_PACKETS};
use esploader_lib::Error;
use std::time::Duration;

#[test]
fn test_checksum() {
    assert_eq!(checksum(&[]), 0xEF);
    assert_eq!(checksum(&[0x01, 0x02, 0x04]), 0xE8);
}

#[test]
fn test_timeout_per_mb() {
    assert_eq!(timeout_per_mb(30_000, 1_000_000), Duration::from_secs(30));
    assert_eq!(timeout_per_mb(8_000, 1000), DEFAULT_TIMEOUT);
    assert_eq!(timeout_per_mb(40_000, 0x4000), DEFAULT_TIMEOUT);
}

#[test]
fn test_build_request_layout() {
    let packet = build_request(Opcode::FlashData, &[0xAA, 0xBB], 0x42);
    assert_eq!(packet, vec![0x00, 0x03, 0x02, 0x00, 0x42, 0, 0, 0, 0xAA, 0xBB]);
}

#[test]
fn test_response_parse() {
    let frame = [0x01, 0x0a, 0x02, 0x00, 0x78, 0x56, 0x34, 0x12, 0x00, 0x00];
    let packet = ResponsePacket::parse(&frame).unwrap();
    assert_eq!(packet.direction, 0x01);
    assert_eq!(packet.op, Opcode::ReadReg as u8);
    assert_eq!(packet.size, 2);
    assert_eq!(packet.value, 0x1234_5678);
    assert_eq!(packet.data, vec![0, 0]);
    assert!(!packet.is_invalid_message());

    assert!(ResponsePacket::parse(&[0x01, 0x0a, 0x00]).is_none());
    assert_eq!(Opcode::from_repr(0xd2), Some(Opcode::ReadFlash));
    assert_eq!(Opcode::SpiFlashMd5.to_string(), "SPI_FLASH_MD5");
}

#[test]
fn test_rejected_command_is_unsupported() {
    let mut link = FakeEsp::esp32();
    link.rejected.push(Opcode::SpiAttach);
    let mut connection = Connection::new(link);

    let err = connection
        .check_command(
            "configure SPI flash pins",
            Opcode::SpiAttach,
            &command::pack_u32(&[0, 0]),
            0,
            DEFAULT_TIMEOUT,
        )
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedCommand(_)));
    assert_eq!(connection.link().requests.len(), 1);
}

#[test]
fn test_unrelated_packets_exhaust_read_bound() {
    let mut link = FakeEsp::esp32();
    let stray = [0x01, 0x0a, 0x04, 0x00, 0, 0, 0, 0, 0, 0, 0, 0];
    for _ in 0..MAX_READ_PACKETS {
        link.queue_frame(&stray);
    }
    let mut connection = Connection::new(link);

    let err = connection
        .check_command("leave Flash mode", Opcode::FlashEnd, &[0; 4], 0, DEFAULT_TIMEOUT)
        .unwrap_err();
    match err {
        Error::InvalidResponse(_, reads) => assert_eq!(reads, MAX_READ_PACKETS),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn test_failed_status_is_reported() {
    let mut link = FakeEsp::esp32();
    link.queue_frame(&[0x01, 0x0a, 0x04, 0x00, 0, 0, 0, 0, 0x01, 0x06, 0, 0]);
    let mut connection = Connection::new(link);
    connection.set_status_len(4);

    let err = connection.read_reg(0x6000_0000).unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
}

#[test]
fn test_read_reg_and_write_reg() {
    let mut connection = Connection::new(FakeEsp::esp32());
    connection.set_status_len(4);
    assert_eq!(connection.read_reg(0x4000_1000).unwrap(), 0x00f0_1d83);

    connection.write_reg(0x3ff4_2080, 0xCAFE, 0xFFFF_FFFF, 0).unwrap();
    assert_eq!(connection.read_reg(0x3ff4_2080).unwrap(), 0xCAFE);

    let writes = connection.link().requests_for(Opcode::WriteReg);
    assert_eq!(writes[0].payload, command::pack_u32(&[0x3ff4_2080, 0xCAFE, 0xFFFF_FFFF, 0]));
}

#[test]
fn test_check_command_returns_data_for_long_payloads() {
    let mut connection = Connection::new(FakeEsp::esp32().with_stub());
    connection.link_mut().flash[..4].copy_from_slice(&[1, 2, 3, 4]);
    let result = connection
        .check_command(
            "calculate md5sum",
            Opcode::SpiFlashMd5,
            &command::pack_u32(&[0, 4, 0, 0]),
            0,
            DEFAULT_TIMEOUT,
        )
        .unwrap();
    match result {
        CommandResult::Data(data) => assert_eq!(data.len(), 20),
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn test_sync_detects_running_stub() {
    let mut rom = Connection::new(FakeEsp::esp32());
    assert!(!rom.sync().unwrap());

    let mut stub = Connection::new(FakeEsp::esp32().with_stub());
    assert!(stub.sync().unwrap());

    let mut silent = FakeEsp::esp32();
    silent.sync_failures = 1;
    let mut silent = Connection::new(silent);
    assert!(silent.sync().unwrap_err().is_timeout());
}
