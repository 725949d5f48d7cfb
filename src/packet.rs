//! The on-wire packet layout and the stateless codec.
//!
//! A datagram carries a 10-octet packed header in network byte order,
//! followed by `opts_count` option records and the payload. This core emits
//! no options but preserves the count field on decode. Encode and decode are
//! pure; round-tripping any well-formed header and in-bounds payload returns
//! the inputs unchanged.

use thiserror::Error;

pub const ETHERNET_MTU: usize = 1500;
pub const INTERNET_MTU: usize = 576;
pub const IP_MTU: usize = 65535;
pub const IPV4_HEADER_SIZE: usize = 20;
pub const UDP_HEADER_SIZE: usize = 8;

/// Size of the packed header on the wire: three u16 counters, the option
/// count, the flags byte and the u16 window advertisement.
pub const HEADER_SIZE: usize = 10;

/// Maximum size of one whole packet (header + options + payload).
pub const MAX_UDP_PAYLOAD: usize = IP_MTU - IPV4_HEADER_SIZE - UDP_HEADER_SIZE;
/// Maximum options + payload carried by one packet.
pub const MAX_RTP_PAYLOAD: usize = MAX_UDP_PAYLOAD - HEADER_SIZE;
/// Largest payload `write` accepts, sized to dodge Ethernet fragmentation.
pub const MSS_CEILING: usize =
    ETHERNET_MTU - IPV4_HEADER_SIZE - UDP_HEADER_SIZE - HEADER_SIZE;
/// Smallest MSS worth advertising, sized to the classic internet MTU.
pub const MSS_FLOOR: usize = INTERNET_MTU - IPV4_HEADER_SIZE - UDP_HEADER_SIZE - HEADER_SIZE;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    #[error("buffer is shorter than the packet header")]
    HeaderTooShort,
    #[error("payload of {0} bytes exceeds the datagram ceiling")]
    OversizedPayload(usize),
}

/// The fixed header stamped on every packet.
///
/// `seq_nr` and `ack_nr` count packets, not bytes. `peer_sock_id` is the
/// receiver's connection id, so the receiving host can demultiplex without
/// trusting the source address alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub seq_nr: u16,
    pub ack_nr: u16,
    pub peer_sock_id: u16,
    pub opts_count: u8,
    pub ctl: Control,
    pub window_size: u16,
}

impl PacketHeader {
    pub fn serialize(&self) -> [u8; HEADER_SIZE] {
        let seq = self.seq_nr.to_be_bytes();
        let ack = self.ack_nr.to_be_bytes();
        let sock = self.peer_sock_id.to_be_bytes();
        let wnd = self.window_size.to_be_bytes();
        [
            seq[0],
            seq[1],
            ack[0],
            ack[1],
            sock[0],
            sock[1],
            self.opts_count,
            self.ctl.into(),
            wnd[0],
            wnd[1],
        ]
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < HEADER_SIZE {
            return Err(PacketError::HeaderTooShort);
        }
        Ok(PacketHeader {
            seq_nr: u16::from_be_bytes([bytes[0], bytes[1]]),
            ack_nr: u16::from_be_bytes([bytes[2], bytes[3]]),
            peer_sock_id: u16::from_be_bytes([bytes[4], bytes[5]]),
            opts_count: bytes[6],
            ctl: Control::from(bytes[7]),
            window_size: u16::from_be_bytes([bytes[8], bytes[9]]),
        })
    }
}

/// Emits the header followed by the payload, network byte order throughout.
pub fn encode(header: &PacketHeader, payload: &[u8]) -> Result<Vec<u8>, PacketError> {
    if payload.len() > MAX_RTP_PAYLOAD {
        return Err(PacketError::OversizedPayload(payload.len()));
    }
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&header.serialize());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Splits a datagram into its typed header and payload view.
pub fn decode(bytes: &[u8]) -> Result<(PacketHeader, &[u8]), PacketError> {
    let header = PacketHeader::from_bytes(bytes)?;
    let payload = &bytes[HEADER_SIZE..];
    if payload.len() > MAX_RTP_PAYLOAD {
        return Err(PacketError::OversizedPayload(payload.len()));
    }
    Ok((header, payload))
}

#[derive(Debug, Default, Clone, Copy, Hash, PartialEq, Eq)]
pub struct Control(u8);

impl Control {
    pub fn new(urg: bool, ack: bool, rst: bool, syn: bool, fin: bool) -> Self {
        Self(
            urg as u8
                | (ack as u8) << 1
                | (rst as u8) << 2
                | (syn as u8) << 3
                | (fin as u8) << 4,
        )
    }

    /// Urgent payload, delivered out of band
    pub fn urg(&self) -> bool {
        self.0 & 0b1 == 1
    }

    /// Acknowledgment field significant
    pub fn ack(&self) -> bool {
        (self.0 >> 1) & 0b1 == 1
    }

    /// Reset the connection
    pub fn rst(&self) -> bool {
        (self.0 >> 2) & 0b1 == 1
    }

    /// Synchronize sequence numbers
    pub fn syn(&self) -> bool {
        (self.0 >> 3) & 0b1 == 1
    }

    /// No more data from sender
    pub fn fin(&self) -> bool {
        (self.0 >> 4) & 0b1 == 1
    }
}

impl From<u8> for Control {
    fn from(n: u8) -> Self {
        Self(n)
    }
}

impl From<Control> for u8 {
    fn from(control: Control) -> Self {
        control.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size_is_packed() {
        let header = PacketHeader {
            seq_nr: 0,
            ack_nr: 0,
            peer_sock_id: 0,
            opts_count: 0,
            ctl: Control::default(),
            window_size: 0,
        };
        assert_eq!(header.serialize().len(), HEADER_SIZE);
    }

    #[test]
    fn round_trips() {
        let header = PacketHeader {
            seq_nr: 0xcafe,
            ack_nr: 0xbabe,
            peer_sock_id: 7,
            opts_count: 3,
            ctl: Control::new(false, true, false, true, false),
            window_size: 1024,
        };
        let payload = b"Hello, world!";
        let bytes = encode(&header, payload).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + payload.len());

        let (parsed, body) = decode(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(body, payload);
        assert_eq!(parsed.opts_count, 3);
    }

    #[test]
    fn network_byte_order() {
        let header = PacketHeader {
            seq_nr: 0x1234,
            ack_nr: 0x5678,
            peer_sock_id: 0x9abc,
            opts_count: 0,
            ctl: Control::new(false, true, false, false, false),
            window_size: 0xdef0,
        };
        let bytes = header.serialize();
        assert_eq!(&bytes[..2], &[0x12, 0x34]);
        assert_eq!(&bytes[2..4], &[0x56, 0x78]);
        assert_eq!(&bytes[4..6], &[0x9a, 0xbc]);
        assert_eq!(&bytes[8..10], &[0xde, 0xf0]);
    }

    #[test]
    fn control_bits() {
        let ctl = Control::new(true, true, false, false, true);
        assert!(ctl.urg());
        assert!(ctl.ack());
        assert!(!ctl.rst());
        assert!(!ctl.syn());
        assert!(ctl.fin());
        assert_eq!(Control::from(u8::from(ctl)), ctl);
    }

    #[test]
    fn rejects_short_buffer() {
        assert_eq!(decode(&[0u8; 9]), Err(PacketError::HeaderTooShort));
        assert!(decode(&[0u8; 10]).is_ok());
    }

    #[test]
    fn rejects_oversized_payload() {
        let header = PacketHeader {
            seq_nr: 0,
            ack_nr: 0,
            peer_sock_id: 0,
            opts_count: 0,
            ctl: Control::default(),
            window_size: 0,
        };
        let payload = vec![0u8; MAX_RTP_PAYLOAD + 1];
        assert_eq!(
            encode(&header, &payload),
            Err(PacketError::OversizedPayload(MAX_RTP_PAYLOAD + 1))
        );
    }
}
