/// Reassembles newline-delimited payloads from an arbitrarily chunked byte
/// stream. Complete lines are returned as they finish; the trailing partial
/// segment is retained until the next chunk arrives, so the yielded sequence
/// is identical no matter how the stream was chunked.
#[derive(Debug, Default)]
pub struct LineBuffer {
    residual: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line completed by it, in order.
    /// Carriage returns before the delimiter are stripped; empty lines are
    /// skipped since they cannot carry a payload.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.residual.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.residual.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.residual.drain(..=pos).collect();
            line.pop(); // the delimiter
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if !line.is_empty() {
                lines.push(String::from_utf8_lossy(&line).into_owned());
            }
        }
        lines
    }

    /// The retained partial segment, if any.
    pub fn residual(&self) -> &[u8] {
        &self.residual
    }
}
