//! Legacy flashloader frame layout
//!
//! Requests go out on one fixed CAN identifier, responses come back on
//! another. A request is `[command, args...]`; a positive response echoes
//! the command plus 0x40, a negative response is `[0x7F, command, code]`.
//! Device names span multiple frames: `[command|0x40, seq, chars...]` with
//! the high bit of `seq` marking the last chunk.

/// CAN identifier all requests are sent on.
pub const REQUEST_CAN_ID: u32 = 0x710;

/// CAN identifier all responses arrive on.
pub const RESPONSE_CAN_ID: u32 = 0x718;

/// Local id addressing every device on the segment.
pub const LOCAL_ID_BROADCAST: u8 = 0xFF;

/// Offset added to a command byte in a positive response.
pub const POSITIVE_OFFSET: u8 = 0x40;

/// First byte of a negative response.
pub const NEGATIVE_RESPONSE: u8 = 0x7F;

/// Upper bound on serial numbers enumerated per local id. Multiple
/// physical devices may share one id before individualization; the cap
/// bounds the worst case.
pub const MAX_ENUMERATED_SERIALS: usize = 100;

/// Marks the final chunk of a device-name response.
pub const NAME_LAST_CHUNK: u8 = 0x80;

/// Command bytes of the legacy flashloader protocol.
pub mod command {
    pub const WAKE_BY_LOCAL_ID: u8 = 0x01;
    pub const WAKE_BY_SERIAL: u8 = 0x02;
    pub const IDENTIFY: u8 = 0x03;
    pub const GET_SERIAL_NUMBER: u8 = 0x04;
    pub const GET_DEVICE_NAME: u8 = 0x05;
    pub const SET_LOCAL_ID: u8 = 0x06;
    pub const SET_BITRATE: u8 = 0x07;
    pub const FLASH_PULSE: u8 = 0x08;
    pub const RESET_NETWORK: u8 = 0x09;
}

/// Positive response byte for a command.
pub fn positive(cmd: u8) -> u8 {
    cmd + POSITIVE_OFFSET
}
