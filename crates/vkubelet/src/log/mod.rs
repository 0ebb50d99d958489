//! `log` contains convenient wrappers for streaming container logs back to a
//! client of the pod HTTP surface.
//!
//! Providers may prefix each line with an RFC 3339 timestamp and a space, the
//! layout container runtimes write their log files in. Such lines are subject
//! to `sinceSeconds` and lose their timestamp unless the client asked for
//! `timestamps`. Lines without one are always sent as they are.
use anyhow::bail;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead};
use tracing::{debug, error};

/// Possible errors sending log data.
#[derive(Debug, Error)]
pub enum SendError {
    /// Client has disconnected.
    #[error("ChannelClosed")]
    ChannelClosed,
    /// The client's byte limit was reached.
    #[error("LimitReached")]
    LimitReached,
    /// An unexpected error occured.
    #[error(transparent)]
    Abnormal(anyhow::Error),
}

impl From<std::io::Error> for SendError {
    fn from(error: std::io::Error) -> Self {
        SendError::Abnormal(anyhow::Error::new(error))
    }
}

/// Client options for fetching logs.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Options {
    /// the number of lines to stream back to the client.
    #[serde(rename = "tailLines")]
    pub tail: Option<usize>,
    /// determines whether the stream should stay open after tailing until the channel has closed.
    #[serde(default)]
    pub follow: bool,
    /// whether each line should be prefixed with its timestamp.
    #[serde(default)]
    pub timestamps: bool,
    /// the maximum number of bytes to send.
    pub limit_bytes: Option<usize>,
    /// only return lines newer than this many seconds.
    pub since_seconds: Option<i64>,
}

/// Sender for streaming logs to client.
pub struct Sender {
    sender: hyper::body::Sender,
    opts: Options,
    since: Option<DateTime<Utc>>,
    sent: usize,
}

impl Sender {
    /// Create new `Sender` from `hyper::body::Sender`.
    pub fn new(sender: hyper::body::Sender, opts: Options) -> Self {
        let since = opts
            .since_seconds
            .map(|seconds| Utc::now() - Duration::seconds(seconds));
        Sender {
            sender,
            opts,
            since,
            sent: 0,
        }
    }

    /// Drops the follow flag, for output that will never grow.
    pub fn without_follow(mut self) -> Self {
        self.opts.follow = false;
        self
    }

    /// The options the client asked for.
    pub fn options(&self) -> &Options {
        &self.opts
    }

    /// The tail flag indicated by the request if present.
    pub fn tail(&self) -> Option<usize> {
        self.opts.tail
    }

    /// The follow flag indicated by the request, or `false` if absent.
    pub fn follow(&self) -> bool {
        self.opts.follow
    }

    /// Applies `sinceSeconds` and `timestamps` to one line of output.
    ///
    /// Returns `None` when the line is older than the cutoff.
    fn render(&self, line: String) -> Option<String> {
        let stamped = line.split_once(' ').and_then(|(stamp, message)| {
            DateTime::parse_from_rfc3339(stamp)
                .ok()
                .map(|at| (at.with_timezone(&Utc), message.len()))
        });
        let (at, message_len) = match stamped {
            Some(stamped) => stamped,
            None => return Some(line),
        };
        if self.since.map_or(false, |since| at < since) {
            return None;
        }
        if self.opts.timestamps {
            Some(line)
        } else {
            Some(line[line.len() - message_len..].to_owned())
        }
    }

    /// Async send some data to a client.
    ///
    /// Data beyond the client's `limitBytes` is cut off and reported as
    /// [`SendError::LimitReached`].
    pub async fn send(&mut self, data: String) -> Result<(), SendError> {
        let mut data = data.into_bytes();
        let mut limited = false;
        if let Some(limit) = self.opts.limit_bytes {
            let remaining = limit.saturating_sub(self.sent);
            if data.len() >= remaining {
                data.truncate(remaining);
                limited = true;
            }
        }
        self.sent += data.len();
        if !data.is_empty() {
            let b: hyper::body::Bytes = data.into();
            self.sender.send_data(b).await.map_err(|e| {
                if e.is_closed() {
                    debug!("channel closed.");
                    SendError::ChannelClosed
                } else {
                    error!("channel error: {}", e);
                    SendError::Abnormal(anyhow::Error::new(e))
                }
            })?;
        }
        if limited {
            return Err(SendError::LimitReached);
        }
        Ok(())
    }
}

/// Stream last `n` lines.
async fn tail<R: AsyncRead + std::marker::Unpin>(
    lines: &mut tokio::io::Lines<tokio::io::BufReader<R>>,
    sender: &mut Sender,
    n: usize,
) -> Result<(), SendError> {
    let mut line_buf = std::collections::VecDeque::with_capacity(n);

    while let Some(line) = lines.next_line().await? {
        let line = match sender.render(line) {
            Some(line) => line,
            None => continue,
        };
        if n == 0 {
            continue;
        }
        if line_buf.len() == n {
            line_buf.pop_front();
        }
        line_buf.push_back(line);
    }

    for mut line in line_buf {
        line.push('\n');
        sender.send(line).await?;
    }
    Ok(())
}

/// Stream log to end.
async fn stream_to_end<R: AsyncRead + std::marker::Unpin>(
    lines: &mut tokio::io::Lines<tokio::io::BufReader<R>>,
    sender: &mut Sender,
) -> Result<(), SendError> {
    while let Some(line) = lines.next_line().await? {
        let mut line = match sender.render(line) {
            Some(line) => line,
            None => continue,
        };
        line.push('\n');
        sender.send(line).await?;
    }
    Ok(())
}

/// Future that streams logs from provided `AsyncRead` to provided `Sender`.
///
/// Providers that keep container output in a file, pipe or buffer can hand it
/// here and get `sinceSeconds`, `timestamps`, `tailLines`, `follow` and
/// `limitBytes` handling for free.
pub async fn stream<R: AsyncRead + std::marker::Unpin>(
    handle: R,
    mut sender: Sender,
) -> anyhow::Result<()> {
    let buf = tokio::io::BufReader::new(handle);
    let mut lines = buf.lines();

    let first = match sender.tail() {
        Some(n) => tail(&mut lines, &mut sender, n).await,
        None => stream_to_end(&mut lines, &mut sender).await,
    };
    match first {
        Ok(_) => (),
        Err(SendError::ChannelClosed) | Err(SendError::LimitReached) => return Ok(()),
        Err(SendError::Abnormal(e)) => bail!(e),
    }

    if sender.follow() {
        loop {
            match stream_to_end(&mut lines, &mut sender).await {
                Ok(_) => (),
                Err(SendError::ChannelClosed) | Err(SendError::LimitReached) => return Ok(()),
                Err(SendError::Abnormal(e)) => bail!(e),
            }

            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use futures::StreamExt;
    use hyper::Body;

    async fn collect(body: Body) -> String {
        let chunks: Vec<_> = body.collect().await;
        let bytes: Vec<u8> = chunks
            .into_iter()
            .flat_map(|c| c.unwrap().to_vec())
            .collect();
        String::from_utf8(bytes).unwrap()
    }

    async fn run(input: impl Into<String>, opts: Options) -> String {
        let (tx, body) = Body::channel();
        let sender = Sender::new(tx, opts);
        let input = std::io::Cursor::new(input.into().into_bytes());
        let handle = tokio::spawn(stream(input, sender));
        let out = collect(body).await;
        handle.await.unwrap().unwrap();
        out
    }

    #[tokio::test]
    async fn streams_everything_by_default() {
        assert_eq!(run("a\nb\nc\n", Options::default()).await, "a\nb\nc\n");
    }

    #[tokio::test]
    async fn tails_last_lines() {
        let opts = Options {
            tail: Some(2),
            ..Default::default()
        };
        assert_eq!(run("a\nb\nc\n", opts).await, "b\nc\n");
    }

    #[tokio::test]
    async fn honors_byte_limit() {
        let opts = Options {
            limit_bytes: Some(3),
            ..Default::default()
        };
        assert_eq!(run("abcdef\nxyz\n", opts).await, "abc");
    }

    fn stamped(minutes_ago: i64, message: &str) -> String {
        format!(
            "{} {}",
            (Utc::now() - Duration::minutes(minutes_ago)).to_rfc3339(),
            message
        )
    }

    #[tokio::test]
    async fn since_seconds_drops_old_lines() {
        let input = format!(
            "{}\n{}\nplain\n",
            stamped(10, "old"),
            stamped(0, "new")
        );
        let opts = Options {
            since_seconds: Some(60),
            ..Default::default()
        };
        assert_eq!(run(input.clone(), opts).await, "new\nplain\n");
        assert_eq!(run(input, Options::default()).await, "old\nnew\nplain\n");
    }

    #[tokio::test]
    async fn timestamps_are_kept_on_request() {
        let line = stamped(0, "hello");
        let opts = Options {
            timestamps: true,
            ..Default::default()
        };
        assert_eq!(run(format!("{}\n", line), opts).await, format!("{}\n", line));
    }

    #[tokio::test]
    async fn tail_counts_lines_newer_than_since() {
        let input = format!(
            "{}\n{}\n{}\n",
            stamped(10, "a"),
            stamped(0, "b"),
            stamped(0, "c")
        );
        let opts = Options {
            tail: Some(3),
            since_seconds: Some(60),
            ..Default::default()
        };
        assert_eq!(run(input, opts).await, "b\nc\n");
    }
}
