use forkline_common::StoreError;

pub mod fjall;
pub mod memory;

pub(crate) fn backend<E>(error: E) -> StoreError
where
    E: Into<anyhow::Error>,
{
    StoreError::Backend(error.into())
}

pub(crate) fn ensure_running(running: bool) -> Result<(), StoreError> {
    if running {
        Ok(())
    } else {
        Err(StoreError::Stopped)
    }
}
