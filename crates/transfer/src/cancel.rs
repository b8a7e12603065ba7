//! Cancellation checks for blocking file jobs.

use std::io::{self, Read};

use tokio_util::sync::CancellationToken;

use crate::TransferError;

/// Reader that fails every read once `cancel` has fired.
pub(crate) struct CancelOnRead<'a, R> {
    inner: R,
    cancel: &'a CancellationToken,
}

impl<'a, R> CancelOnRead<'a, R> {
    pub(crate) fn new(inner: R, cancel: &'a CancellationToken) -> Self {
        Self { inner, cancel }
    }
}

impl<R: Read> Read for CancelOnRead<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::other("job cancelled"));
        }
        self.inner.read(buf)
    }
}

/// Reports a failed job as [`TransferError::Cancelled`] if the token fired.
pub(crate) fn or_cancelled(e: TransferError, cancel: &CancellationToken) -> TransferError {
    if cancel.is_cancelled() {
        TransferError::Cancelled
    } else {
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_stop_after_cancel() {
        let cancel = CancellationToken::new();
        let mut reader = CancelOnRead::new(&b"abcdef"[..], &cancel);
        let mut buf = [0u8; 3];
        assert_eq!(reader.read(&mut buf).unwrap(), 3);

        cancel.cancel();
        assert!(reader.read(&mut buf).is_err());
        assert!(matches!(
            or_cancelled(TransferError::Task("x".into()), &cancel),
            TransferError::Cancelled
        ));
    }
}
