//! FEC wire framing.
//!
//! Source packets are ordinary RTP packets followed by a fixed-size footer
//! naming their position in the block; the protected bytes are the whole
//! RTP part, so a repaired symbol is a complete RTP packet again. Repair
//! packets carry a fixed-size header (including the stream's SSRC, used for
//! routing) followed by parity bytes.
//!
//! Two schemes are supported. Reed-Solomon m=8 keeps all block fields in
//! one byte (block limit 255); LDPC-Staircase is the large-block scheme
//! with 16-bit fields. All integers are big-endian.

use crate::packet::FecFields;

/// FEC scheme binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FecScheme {
    /// Reed-Solomon, GF(2^8). Block length limited to 255 symbols.
    Rs8m,
    /// LDPC-Staircase, large blocks.
    LdpcStaircase,
}

impl FecScheme {
    /// Footer bytes appended to each source packet.
    pub fn source_footer_len(&self) -> usize {
        match self {
            Self::Rs8m => 8,
            Self::LdpcStaircase => 12,
        }
    }

    /// Header bytes prepended to each repair packet.
    pub fn repair_header_len(&self) -> usize {
        match self {
            Self::Rs8m => 12,
            Self::LdpcStaircase => 16,
        }
    }

    /// Largest total block length the scheme can express.
    pub fn max_block_length(&self) -> usize {
        match self {
            Self::Rs8m => 255,
            Self::LdpcStaircase => 65535,
        }
    }
}

fn check_fields(scheme: FecScheme, fields: &FecFields, is_repair: bool) -> bool {
    let sbl = fields.source_block_length as usize;
    let bl = fields.block_length as usize;
    let esi = fields.encoding_symbol_id as usize;

    if sbl == 0 || bl < sbl || bl > scheme.max_block_length() {
        return false;
    }
    if is_repair {
        esi >= sbl && esi < bl
    } else {
        esi < sbl
    }
}

/// Parse the source footer of a `datagram`. On success returns the FEC view
/// with `payload` covering the protected RTP bytes.
pub fn parse_source_packet(scheme: FecScheme, datagram: &[u8]) -> Option<FecFields> {
    let flen = scheme.source_footer_len();
    if datagram.len() <= flen {
        return None;
    }
    let f = &datagram[datagram.len() - flen..];

    let fields = match scheme {
        FecScheme::Rs8m => FecFields {
            source_block_number: u16::from_be_bytes([f[0], f[1]]),
            encoding_symbol_id: f[2] as u16,
            source_block_length: f[3] as u16,
            block_length: f[4] as u16,
            payload: 0..datagram.len() - flen,
        },
        FecScheme::LdpcStaircase => FecFields {
            source_block_number: u16::from_be_bytes([f[0], f[1]]),
            encoding_symbol_id: u16::from_be_bytes([f[2], f[3]]),
            source_block_length: u16::from_be_bytes([f[4], f[5]]),
            block_length: u16::from_be_bytes([f[6], f[7]]),
            payload: 0..datagram.len() - flen,
        },
    };

    check_fields(scheme, &fields, false).then_some(fields)
}

/// Append a source footer for `fields` to `datagram`.
pub fn compose_source_footer(scheme: FecScheme, fields: &FecFields, datagram: &mut Vec<u8>) {
    match scheme {
        FecScheme::Rs8m => {
            datagram.extend_from_slice(&fields.source_block_number.to_be_bytes());
            datagram.push(fields.encoding_symbol_id as u8);
            datagram.push(fields.source_block_length as u8);
            datagram.push(fields.block_length as u8);
            datagram.extend_from_slice(&[0u8; 3]);
        }
        FecScheme::LdpcStaircase => {
            datagram.extend_from_slice(&fields.source_block_number.to_be_bytes());
            datagram.extend_from_slice(&fields.encoding_symbol_id.to_be_bytes());
            datagram.extend_from_slice(&fields.source_block_length.to_be_bytes());
            datagram.extend_from_slice(&fields.block_length.to_be_bytes());
            datagram.extend_from_slice(&[0u8; 4]);
        }
    }
}

/// Parse a repair datagram. On success returns the stream SSRC and the FEC
/// view with `payload` covering the parity bytes.
pub fn parse_repair_packet(scheme: FecScheme, datagram: &[u8]) -> Option<(u32, FecFields)> {
    let hlen = scheme.repair_header_len();
    if datagram.len() <= hlen {
        return None;
    }
    let h = datagram;
    let ssrc = u32::from_be_bytes([h[0], h[1], h[2], h[3]]);

    let fields = match scheme {
        FecScheme::Rs8m => FecFields {
            source_block_number: u16::from_be_bytes([h[4], h[5]]),
            encoding_symbol_id: h[6] as u16,
            source_block_length: h[7] as u16,
            block_length: h[8] as u16,
            payload: hlen..datagram.len(),
        },
        FecScheme::LdpcStaircase => FecFields {
            source_block_number: u16::from_be_bytes([h[4], h[5]]),
            encoding_symbol_id: u16::from_be_bytes([h[6], h[7]]),
            source_block_length: u16::from_be_bytes([h[8], h[9]]),
            block_length: u16::from_be_bytes([h[10], h[11]]),
            payload: hlen..datagram.len(),
        },
    };

    check_fields(scheme, &fields, true).then_some((ssrc, fields))
}

/// Build a repair datagram from parity bytes.
pub fn compose_repair_packet(
    scheme: FecScheme,
    ssrc: u32,
    fields: &FecFields,
    parity: &[u8],
) -> Vec<u8> {
    let mut datagram = Vec::with_capacity(scheme.repair_header_len() + parity.len());
    datagram.extend_from_slice(&ssrc.to_be_bytes());
    match scheme {
        FecScheme::Rs8m => {
            datagram.extend_from_slice(&fields.source_block_number.to_be_bytes());
            datagram.push(fields.encoding_symbol_id as u8);
            datagram.push(fields.source_block_length as u8);
            datagram.push(fields.block_length as u8);
            datagram.extend_from_slice(&[0u8; 3]);
        }
        FecScheme::LdpcStaircase => {
            datagram.extend_from_slice(&fields.source_block_number.to_be_bytes());
            datagram.extend_from_slice(&fields.encoding_symbol_id.to_be_bytes());
            datagram.extend_from_slice(&fields.source_block_length.to_be_bytes());
            datagram.extend_from_slice(&fields.block_length.to_be_bytes());
            datagram.extend_from_slice(&[0u8; 4]);
        }
    }
    datagram.extend_from_slice(parity);
    datagram
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(sbn: u16, esi: u16, sbl: u16, bl: u16) -> FecFields {
        FecFields {
            source_block_number: sbn,
            encoding_symbol_id: esi,
            source_block_length: sbl,
            block_length: bl,
            payload: 0..0,
        }
    }

    #[test]
    fn test_source_footer_roundtrip() {
        for scheme in [FecScheme::Rs8m, FecScheme::LdpcStaircase] {
            let mut datagram = vec![0xaa; 20]; // stand-in for RTP bytes
            compose_source_footer(scheme, &fields(7, 3, 10, 15), &mut datagram);
            assert_eq!(datagram.len(), 20 + scheme.source_footer_len());

            let parsed = parse_source_packet(scheme, &datagram).unwrap();
            assert_eq!(parsed.source_block_number, 7);
            assert_eq!(parsed.encoding_symbol_id, 3);
            assert_eq!(parsed.source_block_length, 10);
            assert_eq!(parsed.block_length, 15);
            assert_eq!(parsed.payload, 0..20);
        }
    }

    #[test]
    fn test_repair_roundtrip() {
        for scheme in [FecScheme::Rs8m, FecScheme::LdpcStaircase] {
            let parity = [0x55u8; 20];
            let datagram =
                compose_repair_packet(scheme, 0xcafe, &fields(7, 12, 10, 15), &parity);

            let (ssrc, parsed) = parse_repair_packet(scheme, &datagram).unwrap();
            assert_eq!(ssrc, 0xcafe);
            assert_eq!(parsed.encoding_symbol_id, 12);
            assert_eq!(&datagram[parsed.payload.clone()], &parity);
        }
    }

    #[test]
    fn test_rejects_bad_fields() {
        // Source ESI must be below SBL.
        let mut datagram = vec![0xaa; 20];
        compose_source_footer(FecScheme::Rs8m, &fields(0, 12, 10, 15), &mut datagram);
        assert!(parse_source_packet(FecScheme::Rs8m, &datagram).is_none());

        // Repair ESI must be in [SBL, BL).
        let datagram = compose_repair_packet(FecScheme::Rs8m, 1, &fields(0, 3, 10, 15), &[0; 4]);
        assert!(parse_repair_packet(FecScheme::Rs8m, &datagram).is_none());

        // BL below SBL is nonsense.
        let mut datagram = vec![0xaa; 20];
        compose_source_footer(FecScheme::LdpcStaircase, &fields(0, 1, 10, 5), &mut datagram);
        assert!(parse_source_packet(FecScheme::LdpcStaircase, &datagram).is_none());
    }

    #[test]
    fn test_rejects_truncated() {
        assert!(parse_source_packet(FecScheme::Rs8m, &[0u8; 8]).is_none());
        assert!(parse_repair_packet(FecScheme::Rs8m, &[0u8; 12]).is_none());
    }
}
