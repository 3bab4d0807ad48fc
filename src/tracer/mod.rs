pub mod drops;
pub mod event;
pub mod links;
pub mod parse;

#[cfg(feature = "bpf")]
pub mod bpf;

use std::fmt;

use thiserror::Error;

/// Kernel hook points, bound at compile time to the BPF program that
/// services them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    /// Request recognized as issued; records the issuing task.
    Attribution,
    /// Request start on the legacy single-queue path.
    StartLegacy,
    /// Request start on the block-multiqueue path.
    StartMq,
    /// Request completion accounting.
    Completion,
}

impl HookKind {
    /// All hooks in installation order.
    pub const ALL: [HookKind; 4] = [
        HookKind::Attribution,
        HookKind::StartLegacy,
        HookKind::StartMq,
        HookKind::Completion,
    ];

    /// Kernel symbol the kprobe attaches to.
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Attribution => "blk_account_io_start",
            Self::StartLegacy => "blk_start_request",
            Self::StartMq => "blk_mq_start_request",
            Self::Completion => "blk_account_io_completion",
        }
    }

    /// BPF program servicing this hook. Both start paths share one program.
    pub const fn program(self) -> &'static str {
        match self {
            Self::Attribution => "trace_pid_start",
            Self::StartLegacy | Self::StartMq => "trace_req_start",
            Self::Completion => "trace_req_completion",
        }
    }

    /// Label for logs and metrics.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Attribution => "attribution",
            Self::StartLegacy => "start_legacy",
            Self::StartMq => "start_mq",
            Self::Completion => "completion",
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from installing or removing a hook.
#[derive(Error, Debug)]
pub enum HookError {
    #[error("installing {hook} hook at {}: {reason}", symbol_of(.hook))]
    Install { hook: HookKind, reason: String },

    #[error("removing {hook} hook at {}: {reason}", symbol_of(.hook))]
    Remove { hook: HookKind, reason: String },

    #[error("{0} hook is already installed")]
    AlreadyInstalled(HookKind),

    #[error("{0} hook is not installed")]
    NotInstalled(HookKind),
}

fn symbol_of(hook: &HookKind) -> &'static str {
    hook.symbol()
}

impl HookError {
    pub fn hook(&self) -> HookKind {
        match self {
            Self::Install { hook, .. } | Self::Remove { hook, .. } => *hook,
            Self::AlreadyInstalled(hook) | Self::NotInstalled(hook) => *hook,
        }
    }
}

/// Installs and removes kernel hooks. Hook handlers feed the engine; this
/// trait only manages their lifetime.
pub trait HookInstaller: Send {
    /// Attach one hook.
    fn install(&mut self, hook: HookKind) -> Result<(), HookError>;

    /// Detach one hook.
    fn remove(&mut self, hook: HookKind) -> Result<(), HookError>;
}

/// Installer used when the crate is built without the `bpf` feature.
/// Every install fails, so startup aborts with a clear diagnostic.
#[derive(Debug, Default)]
pub struct UnsupportedHooks;

impl HookInstaller for UnsupportedHooks {
    fn install(&mut self, hook: HookKind) -> Result<(), HookError> {
        Err(HookError::Install {
            hook,
            reason: "kprobe support not compiled in (rebuild with --features bpf)".to_string(),
        })
    }

    fn remove(&mut self, hook: HookKind) -> Result<(), HookError> {
        Err(HookError::NotInstalled(hook))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_symbols_are_distinct() {
        let mut symbols: Vec<&str> = HookKind::ALL.iter().map(|h| h.symbol()).collect();
        symbols.sort_unstable();
        symbols.dedup();
        assert_eq!(symbols.len(), 4);
    }

    #[test]
    fn test_start_paths_share_program() {
        assert_eq!(HookKind::StartLegacy.program(), HookKind::StartMq.program());
        assert_ne!(HookKind::Attribution.program(), HookKind::Completion.program());
    }

    #[test]
    fn test_install_order() {
        assert_eq!(HookKind::ALL[0], HookKind::Attribution);
        assert_eq!(HookKind::ALL[3], HookKind::Completion);
    }

    #[test]
    fn test_hook_error_messages_name_symbol() {
        let err = HookError::Install {
            hook: HookKind::StartMq,
            reason: "no such symbol".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "installing start_mq hook at blk_mq_start_request: no such symbol"
        );
        assert_eq!(err.hook(), HookKind::StartMq);
    }

    #[test]
    fn test_unsupported_hooks_always_fail() {
        let mut hooks = UnsupportedHooks;
        let err = hooks
            .install(HookKind::Attribution)
            .expect_err("install must fail without bpf");
        assert!(err.to_string().contains("--features bpf"));
        assert!(matches!(
            hooks.remove(HookKind::Completion),
            Err(HookError::NotInstalled(HookKind::Completion))
        ));
    }
}
