use thiserror::Error;

/// Failures while bringing a bridge session up.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("engine module could not be loaded: {0}")]
    EngineLoad(String),

    #[error("required engine export missing: {0}")]
    MissingExport(&'static str),

    #[error("audio output hooks could not be installed")]
    HookInstall,

    #[error("sync window could not be created")]
    MessageWindow,

    #[error("engine refused to open a session for voice {voice}")]
    EngineOpen { voice: i32 },

    #[error("worker thread could not be spawned")]
    WorkerSpawn,

    #[error("worker thread did not come up in time")]
    WorkerTimeout,
}

/// Soft failures from calls into the foreign engine. These never cross the
/// public API directly; the worker converts them into error markers.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine call returned {0}")]
    CallFailed(i32),

    #[error("engine call faulted")]
    Faulted,

    #[error("engine export missing: {0}")]
    MissingExport(&'static str),

    #[error("operation not supported by this engine")]
    Unsupported,
}
