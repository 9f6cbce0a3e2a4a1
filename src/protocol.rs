//! Simblee wire protocol.
//!
//! Framed commands on the write characteristic, framed notifications on
//! the read/notify characteristic. Multi-byte fields are little-endian.
//!
//! Command frames:
//!
//! | Command                 | Byte 0 | Bytes 1..            |
//! |-------------------------|--------|----------------------|
//! | SET_COLOR               | 0x01   | red, green, blue     |
//! | READ_COLOR              | 0x02   |                      |
//! | FLASH_COLOR_HEADER      | 0x03   | total length (u32)   |
//! | FLASH_COLOR_WRITE_DATA  | 0x04   | index, length, data  |
//!
//! Notification frames:
//!
//! | Notification      | Byte 0 | Bytes 1..        |
//! |-------------------|--------|------------------|
//! | READ_COLOR_RESULT | 0x02   | red, green, blue |
//! | COLOR_CHANGE      | 0xFF   | red, green, blue |

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::device::{DeviceChannel, Notifications};
use crate::error::{Error, Result};

pub const COMMAND_SET_COLOR: u8 = 0x01;
pub const COMMAND_READ_COLOR: u8 = 0x02;
pub const COMMAND_FLASH_COLOR_HEADER: u8 = 0x03;
pub const COMMAND_FLASH_COLOR_WRITE_DATA: u8 = 0x04;

pub const NOTIFICATION_READ_COLOR_RESULT: u8 = 0x02;
pub const NOTIFICATION_COLOR_CHANGE: u8 = 0xFF;

/// Block framing overhead: command byte, block index, block length.
pub const BLOCK_OVERHEAD: usize = 3;

/// Serialized size of one flash entry: 3 color bytes + u64 duration.
pub const FLASH_ENTRY_LEN: usize = 11;

/// An RGB color as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl Color {
    pub const BLACK: Color = Color::rgb(0, 0, 0);
    pub const RED: Color = Color::rgb(0xFF, 0, 0);

    pub const fn rgb(red: u8, green: u8, blue: u8) -> Self {
        Self { red, green, blue }
    }
}

/// One entry of a flash sequence: hold `color` for `duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorFlash {
    pub color: Color,
    pub duration: Duration,
}

impl ColorFlash {
    pub fn new(color: Color, duration: Duration) -> Self {
        Self { color, duration }
    }

    fn serialize_into(&self, out: &mut Vec<u8>) {
        out.push(self.color.red);
        out.push(self.color.green);
        out.push(self.color.blue);
        out.extend_from_slice(&(self.duration.as_millis() as u64).to_le_bytes());
    }
}

/// A decoded notification frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    ReadColorResult(Color),
    ColorChange(Color),
}

pub fn encode_set_color(color: Color) -> [u8; 4] {
    [COMMAND_SET_COLOR, color.red, color.green, color.blue]
}

pub fn encode_read_color() -> [u8; 1] {
    [COMMAND_READ_COLOR]
}

pub fn encode_flash_header(total_len: u32) -> [u8; 5] {
    let len = total_len.to_le_bytes();
    [COMMAND_FLASH_COLOR_HEADER, len[0], len[1], len[2], len[3]]
}

pub fn encode_flash_block(index: u8, data: &[u8]) -> Vec<u8> {
    debug_assert!(data.len() <= u8::MAX as usize);
    let mut block = Vec::with_capacity(BLOCK_OVERHEAD + data.len());
    block.push(COMMAND_FLASH_COLOR_WRITE_DATA);
    block.push(index);
    block.push(data.len() as u8);
    block.extend_from_slice(data);
    block
}

/// Serialize a flash sequence into the peripheral's reconstruction-buffer
/// layout.
pub fn serialize_flashes(flashes: &[ColorFlash]) -> Vec<u8> {
    let mut data = Vec::with_capacity(flashes.len() * FLASH_ENTRY_LEN);
    for flash in flashes {
        flash.serialize_into(&mut data);
    }
    data
}

/// Decode a notification frame.
pub fn decode_notification(bytes: &[u8]) -> Result<Notification> {
    if bytes.len() < 4 {
        return Err(Error::Protocol(format!(
            "notification too short: {} bytes",
            bytes.len()
        )));
    }
    let color = Color::rgb(bytes[1], bytes[2], bytes[3]);
    match bytes[0] {
        NOTIFICATION_READ_COLOR_RESULT => Ok(Notification::ReadColorResult(color)),
        NOTIFICATION_COLOR_CHANGE => Ok(Notification::ColorChange(color)),
        tag => Err(Error::Protocol(format!("unknown notification 0x{tag:02X}"))),
    }
}

/// Color commands layered over any [`DeviceChannel`].
#[async_trait]
pub trait SimbleeCommands: DeviceChannel {
    /// Set the LED color. The peripheral confirms out-of-band with a
    /// COLOR_CHANGE notification.
    async fn set_color(&self, color: Color) -> Result<()> {
        self.write(&encode_set_color(color)).await
    }

    /// Read the current LED color.
    async fn read_color(&self) -> Result<Color> {
        let response = self.write_with_response(&encode_read_color()).await?;
        match decode_notification(&response)? {
            Notification::ReadColorResult(color) => Ok(color),
            other => Err(Error::Protocol(format!(
                "expected read-color result, got {other:?}"
            ))),
        }
    }

    /// Upload a flash sequence.
    ///
    /// Sends the length-prefix header, then the serialized entries split
    /// into sequentially numbered blocks of at most
    /// `maximum_packet_size() - 3` data bytes, each completing its own
    /// write-with-response cycle before the next is sent. The peripheral
    /// reassembles by block index into a single buffer, so dispatch must
    /// stay ordered.
    async fn flash_colors(&self, flashes: &[ColorFlash]) -> Result<()> {
        let data = serialize_flashes(flashes);
        self.write_with_response(&encode_flash_header(data.len() as u32))
            .await?;

        let max_block = self.maximum_packet_size() - BLOCK_OVERHEAD;
        for (index, chunk) in data.chunks(max_block).enumerate() {
            let index = u8::try_from(index).map_err(|_| {
                Error::Protocol("flash sequence exceeds 256 blocks".to_string())
            })?;
            self.write_with_response(&encode_flash_block(index, chunk))
                .await?;
        }
        Ok(())
    }

    /// Decoded stream of out-of-band COLOR_CHANGE notifications.
    fn color_changes(&self) -> ColorChanges {
        ColorChanges {
            notifications: self.notifications(),
        }
    }
}

#[async_trait]
impl<T: DeviceChannel + ?Sized> SimbleeCommands for T {}

/// Stream of colors reported by COLOR_CHANGE notifications; frames that
/// are not color changes are skipped.
pub struct ColorChanges {
    notifications: Notifications,
}

impl ColorChanges {
    pub async fn next(&mut self) -> Result<Color> {
        loop {
            let payload = self.notifications.next().await?;
            if let Ok(Notification::ColorChange(color)) = decode_notification(&payload) {
                return Ok(color);
            }
        }
    }
}
