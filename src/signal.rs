//! Process signal bridge.
//!
//! SIGINT requests a graceful shutdown by cancelling a token. SIGTERM,
//! SIGHUP and SIGQUIT are treated as fatal: the caller exits without
//! detaching.

use std::fmt;

use thiserror::Error;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Signals the bridge listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    Interrupt,
    Terminate,
    Hangup,
    Quit,
}

impl ProcessSignal {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
            Self::Hangup => "SIGHUP",
            Self::Quit => "SIGQUIT",
        }
    }

    /// Only SIGINT leads to a detach and a clean exit.
    pub const fn is_graceful(self) -> bool {
        matches!(self, Self::Interrupt)
    }

    fn kind(self) -> SignalKind {
        match self {
            Self::Interrupt => SignalKind::interrupt(),
            Self::Terminate => SignalKind::terminate(),
            Self::Hangup => SignalKind::hangup(),
            Self::Quit => SignalKind::quit(),
        }
    }
}

impl fmt::Display for ProcessSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Error, Debug)]
pub enum SignalError {
    #[error("registering {signal} handler: {source}")]
    Register {
        signal: ProcessSignal,
        #[source]
        source: std::io::Error,
    },

    #[error("received unexpected signal {0}")]
    Unexpected(ProcessSignal),
}

/// Registered handlers for every [`ProcessSignal`].
pub struct Signals {
    interrupt: Signal,
    terminate: Signal,
    hangup: Signal,
    quit: Signal,
}

impl Signals {
    /// Install the handlers. Must be called from inside a tokio runtime.
    pub fn register() -> Result<Self, SignalError> {
        Ok(Self {
            interrupt: listen(ProcessSignal::Interrupt)?,
            terminate: listen(ProcessSignal::Terminate)?,
            hangup: listen(ProcessSignal::Hangup)?,
            quit: listen(ProcessSignal::Quit)?,
        })
    }

    /// Wait for the next signal.
    pub async fn recv(&mut self) -> ProcessSignal {
        tokio::select! {
            _ = self.interrupt.recv() => ProcessSignal::Interrupt,
            _ = self.terminate.recv() => ProcessSignal::Terminate,
            _ = self.hangup.recv() => ProcessSignal::Hangup,
            _ = self.quit.recv() => ProcessSignal::Quit,
        }
    }

    /// Cancel `shutdown` on SIGINT and return. Any other signal is an
    /// error. Returns quietly if `shutdown` is cancelled elsewhere.
    pub async fn bridge(mut self, shutdown: CancellationToken) -> Result<(), SignalError> {
        let sig = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            sig = self.recv() => sig,
        };

        if sig.is_graceful() {
            tracing::info!(signal = %sig, "received signal, shutting down");
            shutdown.cancel();
            Ok(())
        } else {
            Err(SignalError::Unexpected(sig))
        }
    }
}

fn listen(sig: ProcessSignal) -> Result<Signal, SignalError> {
    signal(sig.kind()).map_err(|source| SignalError::Register {
        signal: sig,
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn raise(sig: libc::c_int) {
        // SAFETY: a handler for `sig` is registered before every call.
        let rc = unsafe { libc::raise(sig) };
        assert_eq!(rc, 0);
    }

    #[test]
    fn test_only_interrupt_is_graceful() {
        assert!(ProcessSignal::Interrupt.is_graceful());
        assert!(!ProcessSignal::Terminate.is_graceful());
        assert!(!ProcessSignal::Hangup.is_graceful());
        assert!(!ProcessSignal::Quit.is_graceful());
        assert_eq!(ProcessSignal::Quit.to_string(), "SIGQUIT");
    }

    #[test]
    fn test_unexpected_signal_message() {
        let err = SignalError::Unexpected(ProcessSignal::Hangup);
        assert_eq!(err.to_string(), "received unexpected signal SIGHUP");
    }

    #[tokio::test]
    #[serial]
    async fn test_sigint_cancels_token() {
        let signals = Signals::register().expect("register");
        let token = CancellationToken::new();

        raise(libc::SIGINT);
        signals.bridge(token.clone()).await.expect("graceful");
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    #[serial]
    async fn test_sighup_is_fatal() {
        let signals = Signals::register().expect("register");
        let token = CancellationToken::new();

        raise(libc::SIGHUP);
        let err = signals.bridge(token.clone()).await.expect_err("fatal");
        assert!(matches!(err, SignalError::Unexpected(ProcessSignal::Hangup)));
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    #[serial]
    async fn test_bridge_returns_when_cancelled_elsewhere() {
        let signals = Signals::register().expect("register");
        let token = CancellationToken::new();
        token.cancel();
        signals.bridge(token).await.expect("no signal needed");
    }
}
