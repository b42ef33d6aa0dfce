//! Read-only existence assertions for test harnesses and drift checks.

use crate::error::VerifyError;
use crate::identity::ProtectedItemIdentity;
use crate::reader::RemoteStateReader;

pub struct ExistenceVerifier {
    reader: RemoteStateReader,
}

impl ExistenceVerifier {
    pub fn new(reader: RemoteStateReader) -> Self {
        Self { reader }
    }

    /// Ok when the binding exists.
    pub async fn assert_exists(&self, identity: &ProtectedItemIdentity) -> Result<(), VerifyError> {
        match self.reader.fetch_identity(identity).await? {
            Some(_) => Ok(()),
            None => Err(VerifyError::NotFound(identity.to_string())),
        }
    }

    /// Ok when the binding does not exist.
    pub async fn assert_absent(&self, identity: &ProtectedItemIdentity) -> Result<(), VerifyError> {
        match self.reader.fetch_identity(identity).await? {
            Some(_) => Err(VerifyError::StillExists(identity.to_string())),
            None => Ok(()),
        }
    }
}
