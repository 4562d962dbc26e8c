//! Binary frame layouts for time-sync and audio-chunk messages.
//!
//! The time-sync layout is session-private but fixed for this receiver; the
//! audio-chunk layout (`u64` LE `server_presentation_us` then codec payload,
//! no tag byte) is the wire contract every server on this protocol must
//! match. The time-sync layout chosen here: a one-byte message-type tag
//! followed by `u64` LE fields, matching the compact framing `bass-webrtc`'s
//! data channel code uses for its own control messages rather than reaching
//! for JSON on a path this hot.

pub const TIMESYNC_REQUEST_TAG: u8 = 0x01;
pub const TIMESYNC_RESPONSE_TAG: u8 = 0x02;

const TIMESYNC_REQUEST_LEN: usize = 9;
const TIMESYNC_RESPONSE_LEN: usize = 25;

/// Encodes a time-sync request: tag (`0x01`) + `client_transmitted_us` as
/// `u64` LE. The server is expected to stamp its own receive/transmit times
/// and echo this value back in the response.
pub fn encode_timesync_request(client_transmitted_us: i64) -> [u8; TIMESYNC_REQUEST_LEN] {
    let mut buf = [0u8; TIMESYNC_REQUEST_LEN];
    buf[0] = TIMESYNC_REQUEST_TAG;
    buf[1..9].copy_from_slice(&(client_transmitted_us as u64).to_le_bytes());
    buf
}

/// Decodes a time-sync response frame into its three wire fields. Returns
/// `None` on a length or tag mismatch rather than erroring — callers treat a
/// malformed time-sync frame the same as a dropped one.
pub fn decode_timesync_response(bytes: &[u8]) -> Option<(i64, i64, i64)> {
    if bytes.len() != TIMESYNC_RESPONSE_LEN || bytes[0] != TIMESYNC_RESPONSE_TAG {
        return None;
    }
    let read_u64 = |offset: usize| -> i64 {
        let mut arr = [0u8; 8];
        arr.copy_from_slice(&bytes[offset..offset + 8]);
        u64::from_le_bytes(arr) as i64
    };
    let client_transmitted_us = read_u64(1);
    let server_received_us = read_u64(9);
    let server_transmitted_us = read_u64(17);
    Some((client_transmitted_us, server_received_us, server_transmitted_us))
}

/// Splits an audio-chunk frame into its `server_presentation_us` header and
/// the remaining codec payload.
pub fn decode_audio_chunk_frame(bytes: &[u8]) -> Option<(i64, &[u8])> {
    if bytes.len() < 8 {
        return None;
    }
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&bytes[..8]);
    let server_presentation_us = u64::from_le_bytes(arr) as i64;
    Some((server_presentation_us, &bytes[8..]))
}

/// Prepends the `server_presentation_us` header to a codec payload.
pub fn encode_audio_chunk_frame(server_presentation_us: i64, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&(server_presentation_us as u64).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timesync_request_round_trips_the_client_timestamp() {
        let encoded = encode_timesync_request(1_234_567_890);
        assert_eq!(encoded[0], TIMESYNC_REQUEST_TAG);
        assert_eq!(encoded.len(), TIMESYNC_REQUEST_LEN);
    }

    #[test]
    fn timesync_response_decodes_the_three_wire_fields_in_order() {
        let mut frame = vec![TIMESYNC_RESPONSE_TAG];
        frame.extend_from_slice(&100u64.to_le_bytes());
        frame.extend_from_slice(&150u64.to_le_bytes());
        frame.extend_from_slice(&151u64.to_le_bytes());
        let (client_tx, server_rx, server_tx) = decode_timesync_response(&frame).unwrap();
        assert_eq!((client_tx, server_rx, server_tx), (100, 150, 151));
    }

    #[test]
    fn timesync_response_rejects_wrong_tag_or_length() {
        assert!(decode_timesync_response(&[0u8; 25]).is_none());
        assert!(decode_timesync_response(&[TIMESYNC_RESPONSE_TAG; 10]).is_none());
    }

    #[test]
    fn audio_chunk_frame_round_trips_through_encode_and_decode() {
        let encoded = encode_audio_chunk_frame(5_000_000, &[1, 2, 3, 4]);
        let (server_us, payload) = decode_audio_chunk_frame(&encoded).unwrap();
        assert_eq!(server_us, 5_000_000);
        assert_eq!(payload, &[1, 2, 3, 4]);
    }

    #[test]
    fn audio_chunk_frame_too_short_is_rejected() {
        assert!(decode_audio_chunk_frame(&[1, 2, 3]).is_none());
    }
}
