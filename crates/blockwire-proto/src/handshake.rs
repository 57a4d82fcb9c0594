//! Pre-protocol handshake.
//!
//! Before the first framed byte, the initiator sends a single hello byte -
//! optionally followed by a cloud network name - and may ask the acceptor
//! to send back its trust certificate. On plain links with no name and no
//! certificate request the whole exchange is exactly one byte.
//!
//! ```text
//! initiator: [type | bits]  [len name]?          type 0x61/0x62
//! acceptor:  [cert_len lo, hi] [cert bytes]?     only if requested,
//!                                                len 0 = no certificate
//! ```
//!
//! Both sides are pure state machines: the owner writes whatever
//! [`pending_out`](ClientHandshake::pending_out) returns, feeds received
//! bytes in, and polls for completion. No I/O happens here.

use crate::{error::ProtocolError, Result};

/// Hello byte: this end is an IO network service publishing an end point.
pub const TYPE_NETWORK_SERVICE: u8 = 0x61;
/// Hello byte: this end is a device or user-interface client.
pub const TYPE_CLIENT: u8 = 0x62;
/// Mask extracting the process type from the hello byte.
pub const TYPE_MASK: u8 = 0x6F;
/// Hello byte bit: a length-prefixed cloud network name follows.
pub const HAS_NET_NAME_BIT: u8 = 0x10;
/// Hello byte bit: send me your trust certificate.
pub const REQUEST_TRUST_CERT_BIT: u8 = 0x80;

/// What kind of process is connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessType {
    /// An IO network service sharing an end point through a relay
    NetworkService,
    /// A device or user-interface client
    Client,
}

impl ProcessType {
    fn to_byte(self) -> u8 {
        match self {
            Self::NetworkService => TYPE_NETWORK_SERVICE,
            Self::Client => TYPE_CLIENT,
        }
    }

    fn from_byte(byte: u8) -> Result<Self> {
        match byte & TYPE_MASK {
            TYPE_NETWORK_SERVICE => Ok(Self::NetworkService),
            TYPE_CLIENT => Ok(Self::Client),
            _ => Err(ProtocolError::BadHandshakeType(byte)),
        }
    }
}

/// Parsed initiator hello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    /// Connecting process type
    pub process_type: ProcessType,
    /// Cloud network name, if the hello carried one
    pub cloud_network: Option<String>,
    /// Whether the initiator asked for the trust certificate
    pub wants_certificate: bool,
}

#[derive(Debug)]
enum ClientPhase {
    SendHello,
    RecvCertLen,
    RecvCert { remaining: usize },
    Done,
}

/// Initiator side of the pre-protocol handshake.
#[derive(Debug)]
pub struct ClientHandshake {
    out: Vec<u8>,
    out_pos: usize,
    phase: ClientPhase,
    staging: Vec<u8>,
    certificate: Option<Vec<u8>>,
}

impl ClientHandshake {
    /// Build the hello for this process.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::StringTooLong`] if the network name exceeds 255
    ///   bytes
    pub fn new(
        process_type: ProcessType,
        cloud_network: Option<&str>,
        request_certificate: bool,
    ) -> Result<Self> {
        let mut first = process_type.to_byte();
        if request_certificate {
            first |= REQUEST_TRUST_CERT_BIT;
        }
        let mut out = Vec::new();
        match cloud_network {
            Some(name) if !name.is_empty() => {
                if name.len() > 255 {
                    return Err(ProtocolError::StringTooLong("cloud_network"));
                }
                out.push(first | HAS_NET_NAME_BIT);
                out.push(name.len() as u8);
                out.extend_from_slice(name.as_bytes());
            }
            _ => out.push(first),
        }
        Ok(Self {
            out,
            out_pos: 0,
            phase: ClientPhase::SendHello,
            staging: Vec::new(),
            certificate: if request_certificate { None } else { Some(Vec::new()) },
        })
    }

    /// Bytes still waiting to be written to the stream.
    #[must_use]
    pub fn pending_out(&self) -> &[u8] {
        &self.out[self.out_pos..]
    }

    /// Record that `n` pending bytes were written.
    pub fn consume_out(&mut self, n: usize) {
        self.out_pos = (self.out_pos + n).min(self.out.len());
        if self.out_pos == self.out.len() {
            if let ClientPhase::SendHello = self.phase {
                self.phase = if self.certificate.is_some() {
                    // Nothing expected back.
                    ClientPhase::Done
                } else {
                    ClientPhase::RecvCertLen
                };
            }
        }
    }

    /// Feed received bytes; returns how many were consumed.
    ///
    /// # Errors
    ///
    /// Currently infallible; kept fallible to match the acceptor side.
    pub fn feed(&mut self, data: &[u8]) -> Result<usize> {
        let mut used = 0;
        loop {
            match &mut self.phase {
                ClientPhase::SendHello | ClientPhase::Done => return Ok(used),
                ClientPhase::RecvCertLen => {
                    while self.staging.len() < 2 && used < data.len() {
                        self.staging.push(data[used]);
                        used += 1;
                    }
                    if self.staging.len() < 2 {
                        return Ok(used);
                    }
                    let len =
                        usize::from(self.staging[0]) | (usize::from(self.staging[1]) << 8);
                    self.staging.clear();
                    if len == 0 {
                        self.certificate = Some(Vec::new());
                        self.phase = ClientPhase::Done;
                    } else {
                        self.phase = ClientPhase::RecvCert { remaining: len };
                    }
                }
                ClientPhase::RecvCert { remaining } => {
                    let n = (*remaining).min(data.len() - used);
                    self.staging.extend_from_slice(&data[used..used + n]);
                    *remaining -= n;
                    used += n;
                    if *remaining == 0 {
                        self.certificate = Some(std::mem::take(&mut self.staging));
                        self.phase = ClientPhase::Done;
                    }
                    if used == data.len() {
                        return Ok(used);
                    }
                }
            }
        }
    }

    /// True when the exchange has fully completed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(self.phase, ClientPhase::Done)
    }

    /// Trust certificate received from the acceptor; empty if none was
    /// offered, `None` until the exchange completes.
    #[must_use]
    pub fn certificate(&self) -> Option<&[u8]> {
        if self.is_complete() { self.certificate.as_deref() } else { None }
    }
}

#[derive(Debug)]
enum ServerPhase {
    RecvHello,
    RecvNameLen { first: u8 },
    RecvName { first: u8, remaining: usize },
    SendCert,
    Done,
}

/// Acceptor side of the pre-protocol handshake.
#[derive(Debug)]
pub struct ServerHandshake {
    phase: ServerPhase,
    staging: Vec<u8>,
    trust_certificate: Vec<u8>,
    out: Vec<u8>,
    out_pos: usize,
    hello: Option<Hello>,
}

impl ServerHandshake {
    /// New acceptor handshake. `trust_certificate` is what gets served if
    /// the initiator asks for one; empty means "none to offer".
    #[must_use]
    pub fn new(trust_certificate: Vec<u8>) -> Self {
        Self {
            phase: ServerPhase::RecvHello,
            staging: Vec::new(),
            trust_certificate,
            out: Vec::new(),
            out_pos: 0,
            hello: None,
        }
    }

    /// Feed received bytes; returns how many were consumed.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::BadHandshakeType`] on an unknown hello byte
    /// - [`ProtocolError::BadUtf8`] on a malformed network name
    pub fn feed(&mut self, data: &[u8]) -> Result<usize> {
        let mut used = 0;
        loop {
            match &mut self.phase {
                ServerPhase::RecvHello => {
                    if used >= data.len() {
                        return Ok(used);
                    }
                    let first = data[used];
                    used += 1;
                    ProcessType::from_byte(first)?;
                    if first & HAS_NET_NAME_BIT != 0 {
                        self.phase = ServerPhase::RecvNameLen { first };
                    } else {
                        self.finish_hello(first, None)?;
                    }
                }
                ServerPhase::RecvNameLen { first } => {
                    if used >= data.len() {
                        return Ok(used);
                    }
                    let first = *first;
                    let len = usize::from(data[used]);
                    used += 1;
                    if len == 0 {
                        self.finish_hello(first, Some(String::new()))?;
                    } else {
                        self.phase = ServerPhase::RecvName { first, remaining: len };
                    }
                }
                ServerPhase::RecvName { first, remaining } => {
                    let n = (*remaining).min(data.len() - used);
                    self.staging.extend_from_slice(&data[used..used + n]);
                    *remaining -= n;
                    used += n;
                    if *remaining > 0 {
                        return Ok(used);
                    }
                    let first = *first;
                    let name = String::from_utf8(std::mem::take(&mut self.staging))
                        .map_err(|_| ProtocolError::BadUtf8)?;
                    self.finish_hello(first, Some(name))?;
                }
                ServerPhase::SendCert | ServerPhase::Done => return Ok(used),
            }
        }
    }

    fn finish_hello(&mut self, first: u8, cloud_network: Option<String>) -> Result<()> {
        let wants_certificate = first & REQUEST_TRUST_CERT_BIT != 0;
        self.hello = Some(Hello {
            process_type: ProcessType::from_byte(first)?,
            cloud_network,
            wants_certificate,
        });
        if wants_certificate {
            let len = self.trust_certificate.len().min(u16::MAX as usize) as u16;
            self.out.push(len as u8);
            self.out.push((len >> 8) as u8);
            self.out.extend_from_slice(&self.trust_certificate[..usize::from(len)]);
            self.phase = ServerPhase::SendCert;
        } else {
            self.phase = ServerPhase::Done;
        }
        Ok(())
    }

    /// Bytes still waiting to be written to the stream.
    #[must_use]
    pub fn pending_out(&self) -> &[u8] {
        &self.out[self.out_pos..]
    }

    /// Record that `n` pending bytes were written.
    pub fn consume_out(&mut self, n: usize) {
        self.out_pos = (self.out_pos + n).min(self.out.len());
        if self.out_pos == self.out.len() {
            if let ServerPhase::SendCert = self.phase {
                self.phase = ServerPhase::Done;
            }
        }
    }

    /// Parsed hello, once received.
    #[must_use]
    pub fn hello(&self) -> Option<&Hello> {
        self.hello.as_ref()
    }

    /// True when the exchange has fully completed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(self.phase, ServerPhase::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Pump bytes between the two sides one at a time until both finish.
    fn run_exchange(client: &mut ClientHandshake, server: &mut ServerHandshake) {
        for _ in 0..1024 {
            if client.is_complete() && server.is_complete() {
                return;
            }
            let out = client.pending_out().to_vec();
            if !out.is_empty() {
                let n = server.feed(&out[..1]).unwrap();
                client.consume_out(n);
                continue;
            }
            // Hello fully written; make sure the phase advances even when
            // nothing is expected back.
            client.consume_out(0);
            let out = server.pending_out().to_vec();
            if !out.is_empty() {
                let n = client.feed(&out[..1]).unwrap();
                server.consume_out(n);
            }
        }
        panic!("handshake did not converge");
    }

    #[test]
    fn one_byte_exchange() {
        let mut client = ClientHandshake::new(ProcessType::Client, None, false).unwrap();
        assert_eq!(client.pending_out(), &[TYPE_CLIENT]);
        let mut server = ServerHandshake::new(Vec::new());
        run_exchange(&mut client, &mut server);

        let hello = server.hello().unwrap();
        assert_eq!(hello.process_type, ProcessType::Client);
        assert_eq!(hello.cloud_network, None);
        assert!(!hello.wants_certificate);
    }

    #[test]
    fn network_name_and_certificate() {
        let mut client =
            ClientHandshake::new(ProcessType::NetworkService, Some("cafenet"), true).unwrap();
        let mut server = ServerHandshake::new(b"TRUSTCERT".to_vec());
        run_exchange(&mut client, &mut server);

        let hello = server.hello().unwrap();
        assert_eq!(hello.process_type, ProcessType::NetworkService);
        assert_eq!(hello.cloud_network.as_deref(), Some("cafenet"));
        assert!(hello.wants_certificate);
        assert_eq!(client.certificate(), Some(&b"TRUSTCERT"[..]));
    }

    #[test]
    fn certificate_request_with_none_to_offer() {
        let mut client = ClientHandshake::new(ProcessType::Client, None, true).unwrap();
        let mut server = ServerHandshake::new(Vec::new());
        run_exchange(&mut client, &mut server);
        assert_eq!(client.certificate(), Some(&[][..]));
    }

    #[test]
    fn unknown_type_byte_rejected() {
        let mut server = ServerHandshake::new(Vec::new());
        assert!(matches!(
            server.feed(&[0x41]),
            Err(ProtocolError::BadHandshakeType(0x41))
        ));
    }

    #[test]
    fn oversized_network_name_rejected() {
        let long = "x".repeat(256);
        assert!(matches!(
            ClientHandshake::new(ProcessType::Client, Some(&long), false),
            Err(ProtocolError::StringTooLong("cloud_network"))
        ));
    }
}
