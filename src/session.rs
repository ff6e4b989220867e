//! Process-global support context and per-connection session state.
//!
//! Grounded on `SUP_CONTEXT` (`util.h`) and `module_ctx` (`core.h`): the
//! source's process-wide mutable block becomes a single owned value built
//! once by [`SupportContext::init`] and handed to every request by
//! reference (`Arc`); the per-session `module_ctx` equivalent is [`Session`],
//! owning at most one [`crate::image::OpenedImage`].

use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Instant;

use crate::apiset::ApiSetNamespace;
use crate::error::EngineError;
use crate::image::OpenedImage;
use crate::knowndlls::KnownDllsList;

/// Accumulated per-image call statistics (bytes sent, send calls, time
/// spent), tracked only when `use_stats` was requested on `open`.
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    /// Total bytes written to the wire for this image's responses.
    pub total_bytes_sent: u64,
    /// Total number of completed `send` operations.
    pub total_send_calls: u64,
    /// Total microseconds spent assembling and sending responses.
    pub total_time_spent_micros: u64,
}

impl SessionStats {
    /// Record one completed send: `len` bytes, `elapsed` wall time.
    pub fn record_send(&mut self, len: usize, elapsed: std::time::Duration) {
        self.total_bytes_sent += len as u64;
        self.total_send_calls += 1;
        self.total_time_spent_micros += elapsed.as_micros() as u64;
    }
}

/// Source of an ApiSet namespace blob: either the process environment
/// (the excluded host-OS collaborator, represented here as "whatever was
/// loaded at `init` time") or a user-supplied file swapped in later via
/// `apisetmapsrc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiSetMapSource {
    /// The process-default map, as sourced by the driver at `init`.
    ProcessDefault,
    /// A namespace blob loaded from an explicit file path.
    File,
}

struct ApiSetMapSlot {
    namespace: Option<ApiSetNamespace>,
    source: ApiSetMapSource,
    file_path: Option<PathBuf>,
}

/// The process-wide, `init`-once, otherwise-immutable support context.
/// Interior mutation is limited to exactly the ApiSet map slot, mutated only
/// by the `apisetmapsrc` command and only between requests (§5).
pub struct SupportContext {
    apiset: RwLock<ApiSetMapSlot>,
    /// KnownDlls lists, populated once at startup and never mutated after.
    pub known_dlls: KnownDllsList,
    /// Step size used while scanning for a free virtual base in `image::open`.
    pub allocation_granularity: u64,
    /// Whether per-image call-stats tracking is available at all (a global
    /// toggle; `open`'s `use_stats` flag still gates it per-session).
    pub call_stats_enabled: bool,
    started_at: Instant,
}

impl SupportContext {
    /// Build the context once, with an optional initial ApiSet namespace
    /// (the driver's process-default source) and a populated KnownDlls list.
    pub fn init(
        default_apiset: Option<ApiSetNamespace>,
        known_dlls: KnownDllsList,
        allocation_granularity: u64,
        call_stats_enabled: bool,
    ) -> Self {
        Self {
            apiset: RwLock::new(ApiSetMapSlot {
                namespace: default_apiset,
                source: ApiSetMapSource::ProcessDefault,
                file_path: None,
            }),
            known_dlls,
            allocation_granularity,
            call_stats_enabled,
            started_at: Instant::now(),
        }
    }

    /// Time elapsed since this context was constructed (used for
    /// `PerformanceFrequency`-style reporting; no wire command currently
    /// surfaces it directly but `callstats` shares this clock).
    pub fn uptime(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }

    /// Borrow the currently active ApiSet namespace, if one is loaded.
    pub fn with_apiset<R>(&self, f: impl FnOnce(Option<&ApiSetNamespace>) -> R) -> R {
        let slot = self.apiset.read().expect("apiset lock poisoned");
        f(slot.namespace.as_ref())
    }

    /// Report which source today's ApiSet namespace came from, and its file
    /// path when applicable.
    pub fn apiset_source(&self) -> (ApiSetMapSource, Option<PathBuf>) {
        let slot = self.apiset.read().expect("apiset lock poisoned");
        (slot.source, slot.file_path.clone())
    }

    /// `apisetmapsrc file "<path>"`: replace the active namespace with one
    /// parsed from `path`. Ownership transfer is atomic from the client's
    /// viewpoint — either this fully replaces the slot or it fails and the
    /// old namespace remains active.
    pub fn set_apiset_from_file(
        &self,
        path: PathBuf,
        namespace: ApiSetNamespace,
    ) -> Result<(), EngineError> {
        let mut slot = self.apiset.write().expect("apiset lock poisoned");
        slot.namespace = Some(namespace);
        slot.source = ApiSetMapSource::File;
        slot.file_path = Some(path);
        Ok(())
    }

    /// `apisetmapsrc` with no argument: revert to the process-default source.
    /// The default namespace itself (sourced from the host OS at `init`) is
    /// the excluded external collaborator; if none was supplied at `init`,
    /// this simply clears the active namespace.
    pub fn reset_apiset_to_default(&self, default_apiset: Option<ApiSetNamespace>) {
        let mut slot = self.apiset.write().expect("apiset lock poisoned");
        slot.namespace = default_apiset;
        slot.source = ApiSetMapSource::ProcessDefault;
        slot.file_path = None;
    }
}

/// Per-connection state: at most one opened image, plus its stats
/// accumulator. Mutated only by `open`/`close`, per spec.md §5.
#[derive(Default)]
pub struct Session {
    /// The image currently open in this session, if any.
    pub image: Option<OpenedImage>,
}

impl Session {
    /// Create an empty session (no image open).
    pub fn new() -> Self {
        Self { image: None }
    }

    /// Borrow the open image, or `NoContext` if none is open.
    pub fn require_image(&self) -> Result<&OpenedImage, EngineError> {
        self.image.as_ref().ok_or(EngineError::NoContext)
    }

    /// `close`: drop the open image (and its virtual buffer) unconditionally.
    pub fn close(&mut self) {
        self.image = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_without_image_requires_context() {
        let session = Session::new();
        assert!(matches!(session.require_image(), Err(EngineError::NoContext)));
    }

    #[test]
    fn support_context_apiset_round_trips() {
        let ctx = SupportContext::init(None, KnownDllsList::default(), 0x10000, true);
        assert!(ctx.with_apiset(|ns| ns.is_none()));
        let (source, path) = ctx.apiset_source();
        assert_eq!(source, ApiSetMapSource::ProcessDefault);
        assert!(path.is_none());
    }
}
