use crate::{
    attributes::{AttributeId, AttributeSet, AttributeTemplate},
    backend::{BackendResult, ObjectHandle, SessionHandle, TokenBackend},
    mechanism::Mechanism,
    secret::SecretBytes,
    token::TokenContext,
};
use std::sync::Arc;

/// Batch size for C_FindObjects.
pub const FIND_BATCH: usize = 20;

/// An authenticated session on the token. Only the pool hands these out.
#[derive(Debug)]
pub struct Session {
    handle: SessionHandle,
    token: Arc<TokenContext>,
}

impl Session {
    pub(crate) fn new(handle: SessionHandle, token: Arc<TokenContext>) -> Self {
        Self { handle, token }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub fn token(&self) -> &Arc<TokenContext> {
        &self.token
    }

    fn backend(&self) -> &dyn TokenBackend {
        self.token.backend()
    }

    /// Run a complete search: init, batched fetches, final. The search is always finalized,
    /// even when a fetch fails, so the session stays usable.
    pub fn find_objects(
        &self,
        template: &AttributeTemplate,
        limit: Option<usize>,
    ) -> BackendResult<Vec<ObjectHandle>> {
        self.backend().find_objects_init(self.handle, template)?;
        let collected = self.collect_objects(limit);
        let finished = self.backend().find_objects_final(self.handle);
        let found = collected?;
        finished?;
        Ok(found)
    }

    fn collect_objects(&self, limit: Option<usize>) -> BackendResult<Vec<ObjectHandle>> {
        let mut found = Vec::new();
        loop {
            let batch = match limit {
                Some(limit) => FIND_BATCH.min(limit - found.len()),
                None => FIND_BATCH,
            };
            if batch == 0 {
                return Ok(found);
            }
            let page = self.backend().find_objects(self.handle, batch)?;
            if page.is_empty() {
                return Ok(found);
            }
            found.extend(page);
        }
    }

    pub fn create_object(&self, template: &AttributeTemplate) -> BackendResult<ObjectHandle> {
        self.backend().create_object(self.handle, template)
    }

    pub fn destroy_object(&self, object: ObjectHandle) -> BackendResult<()> {
        self.backend().destroy_object(self.handle, object)
    }

    pub fn get_attributes(
        &self,
        object: ObjectHandle,
        attributes: &[AttributeId],
    ) -> BackendResult<AttributeSet> {
        self.backend().get_attributes(self.handle, object, attributes)
    }

    pub fn generate_key(
        &self,
        mechanism: &Mechanism,
        template: &AttributeTemplate,
    ) -> BackendResult<ObjectHandle> {
        self.backend().generate_key(self.handle, mechanism, template)
    }

    pub fn generate_key_pair(
        &self,
        mechanism: &Mechanism,
        public_template: &AttributeTemplate,
        private_template: &AttributeTemplate,
    ) -> BackendResult<(ObjectHandle, ObjectHandle)> {
        self.backend()
            .generate_key_pair(self.handle, mechanism, public_template, private_template)
    }

    pub fn encrypt(
        &self,
        mechanism: &Mechanism,
        key: ObjectHandle,
        data: &[u8],
    ) -> BackendResult<Vec<u8>> {
        self.backend().encrypt(self.handle, mechanism, key, data)
    }

    pub fn decrypt(
        &self,
        mechanism: &Mechanism,
        key: ObjectHandle,
        data: &[u8],
    ) -> BackendResult<SecretBytes> {
        self.backend().decrypt(self.handle, mechanism, key, data)
    }

    pub fn sign(&self, mechanism: &Mechanism, key: ObjectHandle, data: &[u8]) -> BackendResult<Vec<u8>> {
        self.backend().sign(self.handle, mechanism, key, data)
    }

    pub fn verify(
        &self,
        mechanism: &Mechanism,
        key: ObjectHandle,
        data: &[u8],
        signature: &[u8],
    ) -> BackendResult<()> {
        self.backend().verify(self.handle, mechanism, key, data, signature)
    }
}
