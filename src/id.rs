use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::{distr::Alphanumeric, Rng};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Length in bytes of the per-connection token.
pub(crate) const TOKEN_BYTES: usize = 32;
/// Length in bytes of the server key echoed on outbound messages.
pub(crate) const SERVER_KEY_BYTES: usize = 32;
/// Length in bytes of the session key presented during migration.
pub(crate) const SESSION_KEY_BYTES: usize = 64;

/// Produce `len` bytes from the thread-local CSPRNG, encoded as URL-safe
/// base64 so the secret survives JSON transport unchanged.
pub(crate) fn secret(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::rng().fill(bytes.as_mut_slice());
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Per-connection secrets generated at handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Secrets {
    pub(crate) token: String,
    pub(crate) server_key: String,
    pub(crate) session_key: String,
}

impl Secrets {
    pub(crate) fn generate() -> Self {
        Self {
            token: secret(TOKEN_BYTES),
            server_key: secret(SERVER_KEY_BYTES),
            session_key: secret(SESSION_KEY_BYTES),
        }
    }
}

/// Generates client IDs.
///
/// IDs are random alphanumeric strings. The allocator does not know which IDs
/// are taken; the registry probes candidates and reports failures back via
/// [`IdAllocator::widen`]. After `max_probes` consecutive collisions the ID
/// length grows by one, which makes further collisions vanishingly unlikely.
#[derive(Debug)]
pub(crate) struct IdAllocator {
    len: AtomicUsize,
    max_probes: usize,
}

impl IdAllocator {
    pub(crate) const fn new(len: usize, max_probes: usize) -> Self {
        Self {
            len: AtomicUsize::new(len),
            max_probes,
        }
    }

    /// Current length of generated IDs.
    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Generate a candidate ID of the current length.
    pub(crate) fn candidate(&self) -> String {
        rand::rng()
            .sample_iter(&Alphanumeric)
            .take(self.len())
            .map(char::from)
            .collect()
    }

    /// Grow the ID length after the probe budget is exhausted. Concurrent
    /// callers that observed the same length only widen once.
    pub(crate) fn widen(&self, observed: usize) {
        let _ = self.len.compare_exchange(
            observed,
            observed + 1,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    /// Generate an ID for which `taken` returns false.
    ///
    /// `taken` must be cheap; it is called up to `max_probes` times per
    /// length. The check is advisory, callers inserting into a shared map
    /// must still insert atomically.
    pub(crate) fn allocate(&self, mut taken: impl FnMut(&str) -> bool) -> String {
        loop {
            let len = self.len();
            for _ in 0..self.max_probes.max(1) {
                let id = self.candidate();
                if !taken(&id) {
                    return id;
                }
            }
            tracing::warn!(len, "client id space congested, widening ids");
            self.widen(len);
        }
    }
}
