use bytes::{Buf, Bytes, BytesMut};

use drift_types::EngineError;

use crate::frame::ControlFrame;

/// Terminates every control frame on the wire.
pub const DELIMITER: [u8; 4] = [0, 0, 0, 0];

/// One decoded item from the byte stream.
#[derive(Debug)]
pub enum WireEvent {
    Control(ControlFrame),
    /// A run of opaque payload bytes. Runs for one file may arrive in
    /// any number of pieces; their total length is exactly the
    /// declared payload length.
    Payload(Bytes),
}

/// Incremental decoder for the mixed control/payload stream.
///
/// `ingest` buffers raw transport bytes; `next_event` yields decoded
/// items one at a time so the caller can declare a payload length
/// between events. In control mode the codec scans for the delimiter
/// and parses each complete record. After `expect_payload(L)` it is
/// in payload mode: bytes are handed out uninterpreted (the delimiter
/// sequence has no meaning inside a payload run) until L bytes have
/// been consumed, at which point it reverts to control mode on its
/// own.
#[derive(Debug, Default)]
pub struct FrameCodec {
    buf: BytesMut,
    payload_remaining: u64,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare that the next `len` stream bytes are opaque payload.
    /// A zero-length declaration is a no-op; the stream stays in
    /// control mode.
    pub fn expect_payload(&mut self, len: u64) {
        self.payload_remaining = len;
    }

    /// Payload bytes still owed before the codec reverts to control
    /// mode.
    pub fn payload_remaining(&self) -> u64 {
        self.payload_remaining
    }

    /// Serialise a control frame with its trailing delimiter.
    pub fn encode(frame: &ControlFrame) -> Result<Bytes, EngineError> {
        let mut out = serde_json::to_vec(frame).map_err(EngineError::MalformedFrame)?;
        out.extend_from_slice(&DELIMITER);
        Ok(Bytes::from(out))
    }

    /// Buffer raw bytes from the transport.
    pub fn ingest(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Decode the next event out of the buffer, if one is complete.
    /// Partial frames and empty buffers yield `None`; callers feed
    /// more bytes and try again, so arbitrary transport chunking is
    /// safe.
    pub fn next_event(&mut self) -> Result<Option<WireEvent>, EngineError> {
        if self.payload_remaining > 0 {
            if self.buf.is_empty() {
                return Ok(None);
            }
            let take = (self.buf.len() as u64).min(self.payload_remaining) as usize;
            let run = self.buf.split_to(take).freeze();
            self.payload_remaining -= run.len() as u64;
            return Ok(Some(WireEvent::Payload(run)));
        }

        match find_delimiter(&self.buf) {
            Some(at) => {
                let record = self.buf.split_to(at);
                self.buf.advance(DELIMITER.len());
                let frame =
                    serde_json::from_slice(&record).map_err(EngineError::MalformedFrame)?;
                Ok(Some(WireEvent::Control(frame)))
            }
            None => Ok(None),
        }
    }

    /// Call when the stream ends. An EOF while payload bytes are
    /// still owed is a truncation.
    pub fn finish(&self) -> Result<(), EngineError> {
        if self.payload_remaining > 0 {
            return Err(EngineError::TruncatedPayload {
                expected: self.payload_remaining,
            });
        }
        Ok(())
    }
}

fn find_delimiter(buf: &[u8]) -> Option<usize> {
    buf.windows(DELIMITER.len()).position(|w| w == DELIMITER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use drift_types::TransferMetadata;
    use rand::RngCore;

    fn metadata(size: u64) -> ControlFrame {
        ControlFrame::Metadata(TransferMetadata {
            file_name: "blob.bin".into(),
            file_size: size,
            current_file: 1,
            total_files: 1,
        })
    }

    /// Drive the codec the way the receive loop does: switch into
    /// payload mode whenever a metadata frame announces a length.
    fn drain(codec: &mut FrameCodec) -> (Vec<u8>, Vec<ControlFrame>) {
        let mut payload = Vec::new();
        let mut controls = Vec::new();
        while let Some(event) = codec.next_event().expect("decode") {
            match event {
                WireEvent::Control(ControlFrame::Metadata(meta)) => {
                    codec.expect_payload(meta.file_size);
                    controls.push(ControlFrame::Metadata(meta));
                }
                WireEvent::Control(frame) => controls.push(frame),
                WireEvent::Payload(run) => payload.extend_from_slice(&run),
            }
        }
        (payload, controls)
    }

    #[test]
    fn decodes_a_single_control_frame() {
        let mut codec = FrameCodec::new();
        codec.ingest(&FrameCodec::encode(&ControlFrame::FileSaved).expect("encode"));

        let (_, controls) = drain(&mut codec);
        assert_eq!(controls, vec![ControlFrame::FileSaved]);
    }

    #[test]
    fn reassembles_frames_split_at_every_boundary() {
        let wire =
            FrameCodec::encode(&ControlFrame::Auth { code: "0FF-1CE".into() }).expect("encode");

        for split in 1..wire.len() {
            let mut codec = FrameCodec::new();
            codec.ingest(&wire[..split]);
            assert!(codec.next_event().expect("decode").is_none(), "split at {split}");
            codec.ingest(&wire[split..]);
            let (_, controls) = drain(&mut codec);
            assert_eq!(
                controls,
                vec![ControlFrame::Auth { code: "0FF-1CE".into() }],
                "split at {split}"
            );
        }
    }

    #[test]
    fn payload_bytes_are_never_interpreted() {
        // Payload deliberately consisting of delimiter sequences.
        let payload = [0u8; 256];

        let mut wire = FrameCodec::encode(&metadata(payload.len() as u64))
            .expect("encode")
            .to_vec();
        wire.extend_from_slice(&payload);
        wire.extend_from_slice(&FrameCodec::encode(&ControlFrame::FileEnd).expect("encode"));

        let mut codec = FrameCodec::new();
        codec.ingest(&wire);
        let (received, controls) = drain(&mut codec);

        assert_eq!(received, payload);
        assert_eq!(controls.last(), Some(&ControlFrame::FileEnd));
    }

    #[test]
    fn arbitrary_chunking_preserves_payload_length() {
        let mut payload = vec![0u8; 10_000];
        rand::rng().fill_bytes(&mut payload);

        let mut wire = FrameCodec::encode(&metadata(payload.len() as u64))
            .expect("encode")
            .to_vec();
        wire.extend_from_slice(&payload);
        wire.extend_from_slice(&FrameCodec::encode(&ControlFrame::FileEnd).expect("encode"));

        for chunk_len in [1usize, 3, 7, 64, 1000, 4096] {
            let mut codec = FrameCodec::new();
            let mut received = Vec::new();
            let mut controls = Vec::new();

            for piece in wire.chunks(chunk_len) {
                codec.ingest(piece);
                let (mut bytes, mut frames) = drain(&mut codec);
                received.append(&mut bytes);
                controls.append(&mut frames);
            }

            assert_eq!(received, payload, "chunk_len {chunk_len}");
            assert_eq!(controls.last(), Some(&ControlFrame::FileEnd), "chunk_len {chunk_len}");
        }
    }

    #[test]
    fn zero_length_payload_stays_in_control_mode() {
        let mut codec = FrameCodec::new();
        codec.expect_payload(0);
        codec.ingest(&FrameCodec::encode(&ControlFrame::FileEnd).expect("encode"));

        let (received, controls) = drain(&mut codec);
        assert!(received.is_empty());
        assert_eq!(controls, vec![ControlFrame::FileEnd]);
    }

    #[test]
    fn garbage_control_record_is_malformed() {
        let mut codec = FrameCodec::new();
        let mut wire = b"this is not json".to_vec();
        wire.extend_from_slice(&DELIMITER);
        codec.ingest(&wire);

        let err = codec.next_event().expect_err("must fail");
        assert!(matches!(err, EngineError::MalformedFrame(_)));
    }

    #[test]
    fn eof_mid_payload_is_truncation() {
        let mut codec = FrameCodec::new();
        codec.expect_payload(100);
        codec.ingest(&[1, 2, 3]);
        assert!(matches!(
            codec.next_event().expect("decode"),
            Some(WireEvent::Payload(run)) if run.len() == 3
        ));

        let err = codec.finish().expect_err("must fail");
        assert!(matches!(err, EngineError::TruncatedPayload { expected: 97 }));
    }
}
