//! Frame reassembly over an unaligned byte stream.
//!
//! Chunks arrive at arbitrary boundaries. The assembler buffers them and
//! yields every complete `\r\n`-terminated frame currently available, so a
//! chunk carrying several frames produces several frames.

/// Terminator appended to every encoded message
pub const FRAME_DELIMITER: &[u8] = b"\r\n";

/// Default upper bound for a single buffered frame (16 MB)
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Per-connection frame buffer
#[derive(Debug)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
    max_frame_len: usize,
    // 区切り文字を含まないことが確認済みのバイト数
    scanned: usize,
    // 上限超過フレームの破棄中。次の区切り文字までのバイトを読み飛ばす
    discarding: bool,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameAssembler {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_len,
            scanned: 0,
            discarding: false,
        }
    }

    /// Append a chunk and drain every complete frame from the buffer.
    ///
    /// Bytes already searched on earlier pushes are not searched again, so a
    /// large frame arriving in small reads costs time linear in its size.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut start = 0;
        // 区切り文字がチャンク境界をまたぐ場合に備えて1バイト戻る
        let mut search_from = self.scanned.saturating_sub(FRAME_DELIMITER.len() - 1);
        while let Some(pos) = find_delimiter(&self.buffer[search_from..]) {
            let end = search_from + pos;
            let len = end - start;
            if self.discarding {
                log::debug!("Skipped {} bytes of oversized frame", len);
                self.discarding = false;
            } else if len > self.max_frame_len {
                log::error!("Dropping frame of {} bytes (limit {})", len, self.max_frame_len);
            } else if len > 0 {
                frames.push(self.buffer[start..end].to_vec());
            }
            start = end + FRAME_DELIMITER.len();
            search_from = start;
        }
        self.buffer.drain(..start);
        self.scanned = self.buffer.len();

        if self.buffer.len() > self.max_frame_len {
            log::error!(
                "Frame exceeds {} bytes without delimiter, discarding {} buffered bytes",
                self.max_frame_len,
                self.buffer.len()
            );
            // 末尾の'\r'は残し、チャンクをまたぐ区切り文字を検出できるようにする
            let keep_cr = self.buffer.last() == Some(&FRAME_DELIMITER[0]);
            self.buffer.clear();
            if keep_cr {
                self.buffer.push(FRAME_DELIMITER[0]);
            }
            self.scanned = 0;
            self.discarding = true;
        }

        frames
    }

    /// Bytes of the current partial frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// End of stream: drop any partial trailing frame and report its length.
    pub fn finish(&mut self) -> usize {
        let dropped = self.buffer.len();
        if dropped > 0 {
            log::debug!("Discarding {} bytes of incomplete frame at end of stream", dropped);
        }
        self.buffer.clear();
        self.scanned = 0;
        self.discarding = false;
        dropped
    }
}

fn find_delimiter(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(FRAME_DELIMITER.len())
        .position(|window| window == FRAME_DELIMITER)
}
