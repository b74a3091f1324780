//! Line-framed JSON-RPC transport to the command-station firmware.
//!
//! One JSON object per line: requests are CRLF-terminated, responses
//! are read up to the first LF. The transport returns the parsed
//! response without interpreting it; callers check `status`. There is
//! no retry logic at this layer.

use std::io::{ErrorKind, Read, Write};
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::debug;

use crate::error::{Error, Result};

/// Default serial baud rate of the command-station firmware.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Default serial read timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// RPC client over any byte-stream connection.
///
/// The connection is exclusively owned for the session; every call is
/// write-then-read, fully flushed before waiting for the response.
pub struct RpcClient<C> {
    conn: C,
}

impl RpcClient<Box<dyn serialport::SerialPort>> {
    /// Opens a serial connection to the command station and waits a
    /// moment for the link to settle.
    pub fn open_serial(port: &str, baud: u32) -> Result<Self> {
        let conn = serialport::new(port, baud)
            .timeout(DEFAULT_TIMEOUT)
            .open()
            .map_err(|e| Error::Io(std::io::Error::new(ErrorKind::Other, e)))?;
        thread::sleep(Duration::from_millis(500));
        Ok(Self::new(conn))
    }
}

impl<C: Read + Write> RpcClient<C> {
    pub fn new(conn: C) -> Self {
        Self { conn }
    }

    /// Sends one request and blocks for the single-line response.
    pub fn call(&mut self, method: &str, params: Value) -> Result<Value> {
        let request = json!({ "method": method, "params": params });
        let mut line = serde_json::to_string(&request)
            .map_err(Error::MalformedResponse)?;
        debug!(%method, "-> {line}");
        line.push_str("\r\n");
        self.conn.write_all(line.as_bytes())?;
        self.conn.flush()?;

        let response_line = self.read_line()?;
        debug!(%method, "<- {response_line}");
        if response_line.is_empty() {
            return Err(Error::NoResponse);
        }
        serde_json::from_str(&response_line).map_err(Error::MalformedResponse)
    }

    /// Reads bytes until LF or timeout and returns the trimmed line.
    fn read_line(&mut self) -> Result<String> {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.conn.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => {
                    if byte[0] == b'\n' {
                        break;
                    }
                    buf.push(byte[0]);
                }
                Err(e) if e.kind() == ErrorKind::TimedOut => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        let line = String::from_utf8_lossy(&buf);
        Ok(line.trim().to_string())
    }

    /// Gives back the underlying connection.
    pub fn into_inner(self) -> C {
        self.conn
    }
}

/// Checks the `status` field of a response, converting anything other
/// than `"ok"` into [`Error::Remote`] carrying the whole body.
pub fn expect_ok(response: Value) -> Result<Value> {
    if response.get("status").and_then(Value::as_str) == Some("ok") {
        Ok(response)
    } else {
        Err(Error::Remote(response))
    }
}
