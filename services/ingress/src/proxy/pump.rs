//! Bidirectional byte relay between two established streams.
//!
//! Each direction runs as its own task. Both tasks report through a
//! completion channel with room for both results; the first report decides
//! the outcome and the other direction is abandoned. Bytes are copied
//! opaquely, in order, with no transformation.
//!
//! The idle timeout covers the session, not a single direction: both
//! directions share one activity clock, so a silent leg never ends a session
//! whose other leg is still moving bytes.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Size of the per-direction copy buffer.
pub const COPY_BUFFER_SIZE: usize = 8192;

/// Default idle timeout (none: a stalled peer holds the session open).
pub const DEFAULT_IDLE_TIMEOUT: Option<Duration> = None;

/// One half-duplex leg of the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// From the first stream to the second.
    AToB,
    /// From the second stream to the first.
    BToA,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::AToB => f.write_str("a_to_b"),
            Direction::BToA => f.write_str("b_to_a"),
        }
    }
}

/// Bytes relayed per direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

type Completion = (Direction, io::Result<()>);

/// Relays bytes between two streams until one direction finishes.
#[derive(Debug, Clone, Default)]
pub struct ConnectionPump {
    idle_timeout: Option<Duration>,
}

impl ConnectionPump {
    /// Create a pump without an idle timeout.
    pub fn new() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    /// Create a pump that fails once neither direction has moved a byte for
    /// `idle_timeout`.
    pub fn with_idle_timeout(idle_timeout: Option<Duration>) -> Self {
        Self { idle_timeout }
    }

    /// Relay `a -> b` and `b -> a` concurrently.
    ///
    /// Returns as soon as either direction completes: EOF is success, any
    /// other error is returned. Both streams are closed before this returns.
    pub async fn pump<A, B>(&self, a: A, b: B) -> io::Result<PumpStats>
    where
        A: AsyncRead + AsyncWrite + Send + 'static,
        B: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);

        let a_to_b = Arc::new(AtomicU64::new(0));
        let b_to_a = Arc::new(AtomicU64::new(0));
        let activity = Arc::new(Activity::new());
        let (done_tx, mut done_rx) = mpsc::channel::<Completion>(2);

        let mut forward = AbortOnDrop(tokio::spawn(copy_direction(
            Direction::AToB,
            a_read,
            b_write,
            Arc::clone(&a_to_b),
            self.idle_timeout,
            Arc::clone(&activity),
            done_tx.clone(),
        )));
        let mut backward = AbortOnDrop(tokio::spawn(copy_direction(
            Direction::BToA,
            b_read,
            a_write,
            Arc::clone(&b_to_a),
            self.idle_timeout,
            activity,
            done_tx,
        )));

        let first = done_rx.recv().await;

        // Abandon the other direction; awaiting the handles drops its halves
        // so both streams are closed on return.
        forward.0.abort();
        backward.0.abort();
        let _ = (&mut forward.0).await;
        let _ = (&mut backward.0).await;

        let stats = PumpStats {
            a_to_b: a_to_b.load(Ordering::Relaxed),
            b_to_a: b_to_a.load(Ordering::Relaxed),
        };

        match first {
            Some((direction, Ok(()))) => {
                debug!(
                    direction = %direction,
                    a_to_b = stats.a_to_b,
                    b_to_a = stats.b_to_a,
                    "Pump finished on EOF"
                );
                Ok(stats)
            }
            Some((direction, Err(e))) => {
                debug!(direction = %direction, error = %e, "Pump direction failed");
                Err(e)
            }
            None => Err(io::Error::other("pump tasks exited without reporting")),
        }
    }
}

/// Aborts the copy task if the pump future itself is dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Last time either direction relayed bytes, shared by both copy tasks.
struct Activity {
    started: Instant,
    last_millis: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_millis: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_millis.fetch_max(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_millis.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }
}

async fn copy_direction<R, W>(
    direction: Direction,
    mut reader: R,
    mut writer: W,
    counter: Arc<AtomicU64>,
    idle_timeout: Option<Duration>,
    activity: Arc<Activity>,
    done: mpsc::Sender<Completion>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = copy_until_eof(&mut reader, &mut writer, &counter, idle_timeout, &activity).await;
    // Capacity 2 with one send per direction, so this never waits.
    let _ = done.send((direction, result)).await;
}

async fn copy_until_eof<R, W>(
    reader: &mut R,
    writer: &mut W,
    counter: &AtomicU64,
    idle_timeout: Option<Duration>,
    activity: &Activity,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let read_result = match idle_timeout {
            Some(limit) => read_while_active(reader, &mut buf, limit, activity).await,
            None => reader.read(&mut buf).await,
        };

        match read_result? {
            0 => return writer.flush().await,
            n => {
                writer.write_all(&buf[..n]).await?;
                counter.fetch_add(n as u64, Ordering::Relaxed);
                activity.touch();
            }
        }
    }
}

/// Read, giving up only when the whole session has been idle for `limit`.
async fn read_while_active<R>(
    reader: &mut R,
    buf: &mut [u8],
    limit: Duration,
    activity: &Activity,
) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    loop {
        let remaining = limit.saturating_sub(activity.idle_for());
        if remaining.is_zero() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout"));
        }
        // `read` is cancel safe, so an expired wait loses no bytes.
        if let Ok(result) = tokio::time::timeout(remaining, reader.read(buf)).await {
            return result;
        }
    }
}
