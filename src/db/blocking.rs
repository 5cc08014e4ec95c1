//! Blocking mirrors of the async API.
//!
//! Every blocking entry point drives the same future as its async twin.

use crate::error::{DbError, DbResult};
use std::future::Future;
use tokio::runtime::{Handle, RuntimeFlavor};

/// Drive `fut` to completion from synchronous code.
///
/// - Outside any runtime: `block_on` on `runtime`, the handle captured at construction.
/// - Inside a multi-thread runtime: `block_in_place` on the current runtime.
/// - Inside a current-thread runtime: unsupported, since blocking the only
///   worker would deadlock the future being waited on.
pub fn wait<T, F>(runtime: Option<&Handle>, fut: F) -> DbResult<T>
where
    F: Future<Output = DbResult<T>>,
{
    match Handle::try_current() {
        Ok(current) => match current.runtime_flavor() {
            RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(move || current.block_on(fut))
            }
            _ => Err(DbError::internal(
                "blocking call inside a current-thread runtime; use the async API instead",
            )),
        },
        Err(_) => match runtime {
            Some(handle) => handle.block_on(fut),
            None => Err(DbError::internal(
                "blocking call outside a tokio runtime with no captured runtime handle",
            )),
        },
    }
}
