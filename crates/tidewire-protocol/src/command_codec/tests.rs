//! Encoding and decoding of whole datagram bodies.

use tidewire_core::{
    error::{DecodingErrorKind, ErrorKind},
    shared::SharedBytes,
};

use super::{CommandDecoder, CommandEncoder, CommandReader};
use crate::command::{
    number, Command, CommandHeader, ConnectParameters, FragmentBody, ProtocolCommand,
    FLAG_ACKNOWLEDGE,
};

fn header(channel_id: u8, reliable_sequence_number: u16) -> CommandHeader {
    CommandHeader { acknowledge: true, unsequenced: false, channel_id, reliable_sequence_number }
}

fn sample_connect() -> ConnectParameters {
    ConnectParameters {
        outgoing_peer_id: 7,
        incoming_session_id: 1,
        outgoing_session_id: 2,
        mtu: 1400,
        window_size: 32768,
        channel_count: 4,
        incoming_bandwidth: 0,
        outgoing_bandwidth: 100_000,
        packet_throttle_interval: 5000,
        packet_throttle_acceleration: 2,
        packet_throttle_deceleration: 2,
        connect_id: 0xDEAD_BEEF,
    }
}

#[test]
fn test_send_reliable_layout() {
    let command = Command::new(
        header(3, 0x0102),
        ProtocolCommand::SendReliable { data: SharedBytes::from_vec(vec![9, 8, 7]) },
    );
    let encoded = CommandEncoder::encode_command(&command).unwrap();
    assert_eq!(
        encoded,
        vec![number::SEND_RELIABLE | FLAG_ACKNOWLEDGE, 3, 0x01, 0x02, 0x00, 0x03, 9, 8, 7]
    );
}

#[test]
fn test_encode_decode_datagram_body() {
    let commands = vec![
        Command::new(header(0xFF, 1), ProtocolCommand::Connect { parameters: sample_connect(), data: 42 }),
        Command::new(header(0xFF, 2), ProtocolCommand::VerifyConnect(sample_connect())),
        Command::new(
            CommandHeader { acknowledge: false, ..header(0xFF, 0) },
            ProtocolCommand::Acknowledge { received_reliable_sequence_number: 5, received_sent_time: 900 },
        ),
        Command::new(header(0xFF, 3), ProtocolCommand::Ping),
        Command::new(
            CommandHeader { acknowledge: false, ..header(1, 4) },
            ProtocolCommand::SendUnreliable {
                unreliable_sequence_number: 11,
                data: SharedBytes::from_vec(vec![1, 2]),
            },
        ),
        Command::new(
            CommandHeader { acknowledge: false, unsequenced: true, channel_id: 0, reliable_sequence_number: 0 },
            ProtocolCommand::SendUnsequenced { unsequenced_group: 77, data: SharedBytes::from_vec(vec![3]) },
        ),
        Command::new(
            header(0, 9),
            ProtocolCommand::SendFragment(FragmentBody {
                start_sequence_number: 9,
                fragment_count: 3,
                fragment_number: 1,
                total_length: 10,
                fragment_offset: 4,
                data: SharedBytes::from_vec(vec![5, 5, 5, 5]),
            }),
        ),
        Command::new(
            header(0xFF, 10),
            ProtocolCommand::BandwidthLimit { incoming_bandwidth: 1, outgoing_bandwidth: 2 },
        ),
        Command::new(
            header(0xFF, 11),
            ProtocolCommand::ThrottleConfigure {
                packet_throttle_interval: 1000,
                packet_throttle_acceleration: 3,
                packet_throttle_deceleration: 4,
            },
        ),
        Command::new(header(0xFF, 12), ProtocolCommand::Disconnect { data: 99 }),
    ];

    let mut body = Vec::new();
    for command in &commands {
        CommandEncoder::encode_command_into(&mut body, command).unwrap();
    }
    let expected_size: usize = commands.iter().map(Command::wire_size).sum();
    assert_eq!(body.len(), expected_size);

    let decoded: Vec<Command> =
        CommandReader::new(SharedBytes::from_vec(body)).collect::<Result<_, _>>().unwrap();
    assert_eq!(decoded, commands);
}

#[test]
fn test_payload_is_a_view_into_the_datagram() {
    let command = Command::new(
        header(0, 1),
        ProtocolCommand::SendReliable { data: SharedBytes::from_vec(vec![1, 2, 3, 4]) },
    );
    let datagram = SharedBytes::from_vec(CommandEncoder::encode_command(&command).unwrap());
    let (decoded, consumed) = CommandDecoder::decode_command(&datagram, 0).unwrap();
    assert_eq!(consumed, datagram.len());
    assert_eq!(decoded.body.payload().unwrap().as_slice(), &[1, 2, 3, 4]);
}

#[test]
fn test_reader_stops_after_first_error() {
    let mut body = Vec::new();
    CommandEncoder::encode_command_into(&mut body, &Command::new(header(0xFF, 1), ProtocolCommand::Ping))
        .unwrap();
    // Unknown command number 13, followed by a well-formed ping the reader must not reach
    body.extend_from_slice(&[13, 0, 0, 0]);
    CommandEncoder::encode_command_into(&mut body, &Command::new(header(0xFF, 2), ProtocolCommand::Ping))
        .unwrap();

    let mut reader = CommandReader::new(SharedBytes::from_vec(body));
    assert!(reader.next().unwrap().is_ok());
    assert!(matches!(
        reader.next(),
        Some(Err(ErrorKind::DecodingError(DecodingErrorKind::UnknownCommand(13))))
    ));
    assert!(reader.next().is_none());
}

#[test]
fn test_truncated_payload_is_rejected() {
    let command = Command::new(
        header(0, 1),
        ProtocolCommand::SendReliable { data: SharedBytes::from_vec(vec![0; 10]) },
    );
    let mut encoded = CommandEncoder::encode_command(&command).unwrap();
    encoded.truncate(encoded.len() - 3);

    let result = CommandDecoder::decode_command(&SharedBytes::from_vec(encoded), 0);
    assert!(matches!(
        result,
        Err(ErrorKind::DecodingError(DecodingErrorKind::LengthMismatch))
    ));
}

#[test]
fn test_truncated_header_is_rejected() {
    let mut reader = CommandReader::new(SharedBytes::from_vec(vec![number::PING, 0xFF]));
    assert!(matches!(
        reader.next(),
        Some(Err(ErrorKind::DecodingError(DecodingErrorKind::Truncated)))
    ));
}
