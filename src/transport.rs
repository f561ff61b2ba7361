// Copyright 2024 Gravitational, Inc
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Virtual reader transport.
//!
//! The reader driver exposes two TCP byte streams, one for data and one for
//! events. Everything on them is 32-bit little-endian framed: the driver
//! sends a command word on the data channel (optionally followed by a
//! length-prefixed APDU) and expects a length-prefixed reply; the emulator
//! pushes card insertion state on the event channel.

use crate::errors::{Error, Result};
use crate::piv::Card;
use log::{debug, info, warn};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

// Data channel command words, driver to emulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
enum ReaderCommand {
    Reset = 0,
    GetAtr = 1,
    Transmit = 2,
}

// Event channel words, emulator to driver.
const EVENT_CARD_REMOVED: u32 = 0;
const EVENT_CARD_INSERTED: u32 = 1;

// An extended APDU tops out just past 64 KiB; anything bigger is a framing
// error, not a command.
const MAX_APDU_LEN: u32 = 0x1_0010;

/// Where to find the virtual reader's TCP channels.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub data_port: u16,
    pub event_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            data_port: 35963,
            event_port: 35964,
        }
    }
}

/// Connects to the reader, announces the card and serves APDUs until the
/// reader hangs up. The card-removed event is sent on the way out.
pub async fn run(mut card: Card, config: &Config) -> Result<()> {
    info!(
        "connecting to virtual reader at {}, data port {}, event port {}",
        config.host, config.data_port, config.event_port
    );
    let mut data = TcpStream::connect((config.host.as_str(), config.data_port)).await?;
    let mut events = TcpStream::connect((config.host.as_str(), config.event_port)).await?;

    events.write_u32_le(EVENT_CARD_INSERTED).await?;
    info!("card inserted");

    let served = serve_data_channel(&mut card, &mut data).await;

    // Best effort: the reader may already be gone.
    let _ = events.write_u32_le(EVENT_CARD_REMOVED).await;
    info!("card removed");
    served
}

async fn serve_data_channel<S>(card: &mut Card, stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let word = match stream.read_u32_le().await {
            Ok(word) => word,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                info!("reader closed the data channel");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        match ReaderCommand::from_u32(word) {
            Some(ReaderCommand::Reset) => {
                let atr = card.reset(true).to_vec();
                write_frame(stream, &atr).await?;
            }
            Some(ReaderCommand::GetAtr) => {
                let atr = card.atr().to_vec();
                write_frame(stream, &atr).await?;
            }
            Some(ReaderCommand::Transmit) => {
                let len = stream.read_u32_le().await?;
                if len > MAX_APDU_LEN {
                    return Err(Error::Transport(format!(
                        "reader framed an APDU of {len} bytes"
                    )));
                }
                let mut raw = vec![0u8; len as usize];
                stream.read_exact(&mut raw).await?;
                let resp = card.process_apdu(&raw);
                write_frame(stream, &resp).await?;
            }
            None => {
                warn!("unknown reader command {word:#010x}");
            }
        }
    }
}

async fn write_frame<S>(stream: &mut S, payload: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    debug!("writing {}-byte frame", payload.len());
    stream.write_u32_le(payload.len() as u32).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}
