use std::io::SeekFrom;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Upper bound on bytes read from the end of a log file, whatever the line count.
const MAX_TAIL_BYTES: u64 = 4 * 1024 * 1024;
const TAIL_CHUNK: u64 = 8 * 1024;

pub fn get_current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn format_rate_limit_key(prefix: &str, key: &str) -> String {
    format!("{}:{}", prefix, key)
}

/// Read at most the last `lines` lines of a file, walking backwards in chunks.
pub async fn tail_lines(path: impl AsRef<Path>, lines: usize) -> std::io::Result<Vec<String>> {
    let mut file = tokio::fs::File::open(path.as_ref()).await?;
    let len = file.metadata().await?.len();
    let floor = len.saturating_sub(MAX_TAIL_BYTES);

    let mut pos = len;
    let mut buf: Vec<u8> = Vec::new();
    while pos > floor {
        let start = pos.saturating_sub(TAIL_CHUNK).max(floor);
        let mut chunk = vec![0u8; (pos - start) as usize];
        file.seek(SeekFrom::Start(start)).await?;
        file.read_exact(&mut chunk).await?;
        chunk.extend_from_slice(&buf);
        buf = chunk;
        pos = start;

        // one extra newline so the first kept line is complete
        if buf.iter().filter(|b| **b == b'\n').count() > lines {
            break;
        }
    }

    let text = String::from_utf8_lossy(&buf);
    let mut all: Vec<&str> = text.lines().collect();
    if pos > 0 && !all.is_empty() {
        // first line is partial
        all.remove(0);
    }
    let skip = all.len().saturating_sub(lines);
    Ok(all[skip..].iter().map(|l| l.to_string()).collect())
}

/// Glob match supporting `*` (any run) and `?` (any single char).
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
