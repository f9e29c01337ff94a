/// Pool error.
///
/// Returned by [`ConnectionPool::acquire`](super::ConnectionPool::acquire) when neither a pooled
/// connection nor a brand new one can provide a healthy channel.
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub struct Error(#[from] anyhow::Error);

impl Error {
    pub fn into_inner(self) -> anyhow::Error {
        self.0
    }
}
