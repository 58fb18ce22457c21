use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;

/// Lines longer than this are cut; the rest of the line is still consumed.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Reads two output streams concurrently and yields their lines through one
/// channel. Order is preserved per stream; the channel closes once both
/// streams reach EOF.
pub fn spawn_merged_lines<O, E>(stdout: O, stderr: E, capacity: usize) -> mpsc::Receiver<String>
where
    O: AsyncRead + Unpin + Send + 'static,
    E: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));
    tokio::spawn(forward_lines(stdout, tx.clone()));
    tokio::spawn(forward_lines(stderr, tx));
    rx
}

/// Sends one `String` per line read from `reader`. At most
/// `MAX_LINE_BYTES` of a line are buffered; the rest is skipped up to the
/// next newline.
pub async fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        let chunk = match reader.fill_buf().await {
            Ok(chunk) => chunk,
            Err(_) => break,
        };
        if chunk.is_empty() {
            if !line.is_empty() {
                let _ = tx.send(decode_line(&line)).await;
            }
            return;
        }
        let (consumed, complete) = match chunk.iter().position(|byte| *byte == b'\n') {
            Some(newline) => (newline + 1, true),
            None => (chunk.len(), false),
        };
        let room = MAX_LINE_BYTES.saturating_sub(line.len());
        line.extend_from_slice(&chunk[..consumed.min(room)]);
        reader.consume(consumed);
        if complete {
            if tx.send(decode_line(&line)).await.is_err() {
                return;
            }
            line.clear();
        }
    }
}

pub fn decode_line(raw: &[u8]) -> String {
    let mut end = raw.len();
    while end > 0 && matches!(raw[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    let raw = &raw[..end.min(MAX_LINE_BYTES)];
    String::from_utf8_lossy(raw).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_strips_line_endings() {
        assert_eq!(decode_line(b"hello\r\n"), "hello");
        assert_eq!(decode_line(b"hello\n"), "hello");
        assert_eq!(decode_line(b"no newline"), "no newline");
        assert_eq!(decode_line(b"\n"), "");
    }

    #[test]
    fn decode_replaces_invalid_utf8() {
        assert_eq!(decode_line(b"ok \xff\n"), "ok \u{fffd}");
    }

    #[test]
    fn oversized_line_is_cut_without_losing_the_next_one() {
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        rt.block_on(async {
            let mut input = vec![b'a'; MAX_LINE_BYTES * 3];
            input.extend_from_slice(b"\nok\ntail");
            let (tx, mut rx) = mpsc::channel(8);
            forward_lines(input.as_slice(), tx).await;
            let first = rx.recv().await.expect("long line");
            assert_eq!(first.len(), MAX_LINE_BYTES);
            assert!(first.bytes().all(|byte| byte == b'a'));
            assert_eq!(rx.recv().await.as_deref(), Some("ok"));
            assert_eq!(rx.recv().await.as_deref(), Some("tail"));
            assert!(rx.recv().await.is_none());
        });
    }

    #[test]
    fn merges_both_streams_in_per_stream_order() {
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        rt.block_on(async {
            let stdout: &[u8] = b"out1\nout2\n";
            let stderr: &[u8] = b"err1\n";
            let mut rx = spawn_merged_lines(stdout, stderr, 8);
            let mut lines = Vec::new();
            while let Some(line) = rx.recv().await {
                lines.push(line);
            }
            assert_eq!(lines.len(), 3);
            let out: Vec<_> = lines.iter().filter(|l| l.starts_with("out")).collect();
            assert_eq!(out, vec!["out1", "out2"]);
            assert!(lines.contains(&"err1".to_string()));
        });
    }
}
