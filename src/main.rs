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

use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{error, info};
use pivert::crypto::CryptoConfig;
use pivert::{pfx, piv, transport, Error};
use std::path::PathBuf;
use std::process::ExitCode;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "pivert", version, about = "PIV smartcard emulator")]
struct Cli {
    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// One-shot installation of the virtual reader driver.
    Install,
    /// Emulate a PIV card holding the credential from a PKCS#12 bundle.
    Run {
        /// Path to the PKCS#12 (.pfx/.p12) bundle.
        pfx_path: PathBuf,
        /// Password protecting the bundle.
        pfx_password: String,
        /// Host the virtual reader listens on.
        #[arg(long, default_value = "127.0.0.1")]
        reader_host: String,
        /// Data channel TCP port of the virtual reader.
        #[arg(long, default_value_t = 35963)]
        data_port: u16,
        /// Event channel TCP port of the virtual reader.
        #[arg(long, default_value_t = 35964)]
        event_port: u16,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> pivert::Result<()> {
    match cli.command {
        Mode::Install => Err(Error::Unsupported(
            "this build does not bundle a virtual reader driver; install one with its own \
             installer (TCP mode enabled), then start the emulator with `pivert run`"
                .into(),
        )),
        Mode::Run {
            pfx_path,
            pfx_password,
            reader_host,
            data_port,
            event_port,
        } => {
            let identity = pfx::load(&pfx_path, &pfx_password)?;
            let card = piv::Card::new(
                Uuid::new_v4(),
                identity.cert_der,
                CryptoConfig::software(identity.key),
            );
            info!("emulating PIV card, ATR {}", hex(card.atr()));
            let config = transport::Config {
                host: reader_host,
                data_port,
                event_port,
            };
            transport::run(card, &config).await
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}
