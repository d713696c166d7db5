//! Prologix GPIB-USB Controller
//!
//! Protocol Overview:
//! - Virtual serial port, 115200 8N1, no flow control
//! - Lines starting with `++` are controller commands; anything else is sent to the
//!   currently addressed instrument
//! - `++addr N` selects the listener, `++read eoi` fetches a response until EOI
//! - `++spoll N` serial-polls an address; a silent instrument times out
//!
//! The controller is put in controller mode with read-after-write disabled on open,
//! so every read is explicit. A reply cut off by the read timeout is drained so its
//! tail cannot prefix the next device's answer.

use crate::hardware::gpib::{DeviceAddress, GpibBus};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

/// Silence that ends the drain after a timed-out read.
const DRAIN_QUIET: Duration = Duration::from_millis(50);

/// GPIB bus reached through a Prologix USB controller
pub struct PrologixBus {
    /// Serial port protected by Mutex for exclusive access
    port: Mutex<BufReader<SerialStream>>,
    /// Read timeout
    timeout: Duration,
}

impl PrologixBus {
    /// Open the controller on `port_path` (e.g. "/dev/ttyUSB0", "COM3").
    ///
    /// # Errors
    /// Returns error if the serial port cannot be opened or initialized
    pub async fn open(port_path: &str, timeout: Duration) -> Result<Self> {
        let port = tokio_serial::new(port_path, 115_200)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .with_context(|| format!("Failed to open Prologix controller at {}", port_path))?;

        let bus = Self {
            port: Mutex::new(BufReader::new(port)),
            timeout,
        };
        bus.send_lines(&["++mode 1", "++auto 0", "++eoi 1", "++eos 3"])
            .await?;
        info!(port = port_path, "Prologix controller ready");
        Ok(bus)
    }

    async fn send_lines(&self, lines: &[&str]) -> Result<()> {
        let mut port = self.port.lock().await;
        for line in lines {
            port.get_mut()
                .write_all(format!("{}\n", line).as_bytes())
                .await
                .context("Prologix write failed")?;
        }
        Ok(())
    }

    async fn exchange(&self, lines: &[String]) -> Result<String> {
        let mut port = self.port.lock().await;
        for line in lines {
            port.get_mut()
                .write_all(format!("{}\n", line).as_bytes())
                .await
                .context("Prologix write failed")?;
        }

        let mut response = String::new();
        match tokio::time::timeout(self.timeout, port.read_line(&mut response)).await {
            Ok(read) => {
                read.context("Prologix read failed")?;
            }
            Err(_) => {
                let dropped = discard_pending(&mut *port, DRAIN_QUIET).await;
                warn!(dropped, "Prologix read timeout, partial reply discarded");
                return Err(anyhow!("Prologix read timeout"));
            }
        }

        let trimmed = response.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("empty response"));
        }
        Ok(trimmed.to_string())
    }
}

/// Drop everything buffered or still arriving until the line stays quiet for `quiet`.
async fn discard_pending<R: AsyncBufRead + Unpin>(reader: &mut R, quiet: Duration) -> usize {
    let mut dropped = 0;
    loop {
        let pending = match tokio::time::timeout(quiet, reader.fill_buf()).await {
            Ok(Ok(bytes)) => bytes.len(),
            _ => 0,
        };
        if pending == 0 {
            return dropped;
        }
        reader.consume(pending);
        dropped += pending;
    }
}

#[async_trait]
impl GpibBus for PrologixBus {
    async fn write(&self, address: DeviceAddress, command: &str) -> Result<()> {
        debug!(%address, command, "GPIB write");
        let select = format!("++addr {}", address);
        self.send_lines(&[select.as_str(), command]).await
    }

    async fn read(&self, address: DeviceAddress) -> Result<String> {
        self.exchange(&[format!("++addr {}", address), "++read eoi".to_string()])
            .await
    }

    async fn identify(&self, address: DeviceAddress) -> Result<()> {
        let status = self.exchange(&[format!("++spoll {}", address)]).await?;
        status
            .parse::<u8>()
            .map(|_| ())
            .map_err(|_| anyhow!("unexpected serial poll reply '{}'", status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test(start_paused = true)]
    async fn timed_out_reply_does_not_prefix_next_reply() {
        let (mut controller, port) = duplex(256);
        let mut reader = BufReader::new(port);

        controller.write_all(b"NDCV+1.2").await.unwrap();
        let mut line = String::new();
        let read =
            tokio::time::timeout(Duration::from_millis(100), reader.read_line(&mut line)).await;
        assert!(read.is_err());

        // Tail of the late reply arrives after the timeout.
        controller.write_all(b"34E-3\n").await.unwrap();
        discard_pending(&mut reader, DRAIN_QUIET).await;

        controller.write_all(b"NDCI+5.0E-4\n").await.unwrap();
        let mut next = String::new();
        reader.read_line(&mut next).await.unwrap();
        assert_eq!(next.trim(), "NDCI+5.0E-4");
    }
}
