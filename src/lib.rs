// SessionLens provisioning engine.
//
// Two entry points share this library:
// - `sessionlens-install`: locally invoked multi-phase installer (full stack
//   or client-only), with dry-run, idempotent re-invocation and automatic
//   rollback.
// - `sessionlens-relay`: remote-install relay that mints single-use install
//   tokens and bridges an authenticated browser connection to a shell
//   session on a caller-supplied target host.
//
// IMPORTANT:
// - Never log secrets (passwords, tokens, keys). Route anything
//   user-supplied through `utils::logging` masking before it reaches a sink.
// - All I/O should be async.

pub mod cli;
pub mod credentials;
pub mod error;
pub mod exec;
pub mod fetcher;
pub mod phases;
pub mod relay;
pub mod rollback;
pub mod utils;
pub mod verify;
