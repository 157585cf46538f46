//! The narrow seam between the engine and a cryptographic token.
//!
//! [`TokenBackend`] exposes only the PKCS#11 calls the engine issues. [`crate::pkcs11`] implements
//! it over a native module, [`crate::soft`] in process. All calls are synchronous and may block.

use std::fmt;

use thiserror::Error;

use crate::{
    attributes::{AttributeId, AttributeSet, AttributeTemplate},
    mechanism::{Mechanism, MechanismType},
    secret::{SecretBytes, SecretString},
};

pub type SlotId = u64;
pub type SessionHandle = u64;
pub type ObjectHandle = u64;

pub type BackendResult<T> = Result<T, BackendError>;

/// Classified CK_RV values the engine reacts to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReturnValue {
    UserAlreadyLoggedIn,
    UserNotLoggedIn,
    PinIncorrect,
    SlotIdInvalid,
    SessionHandleInvalid,
    ObjectHandleInvalid,
    MechanismInvalid,
    MechanismParamInvalid,
    KeyTypeInconsistent,
    KeyFunctionNotPermitted,
    FunctionNotSupported,
    DataLenRange,
    DataInvalid,
    EncryptedDataInvalid,
    EncryptedDataLenRange,
    SignatureInvalid,
    TemplateIncomplete,
    TemplateInconsistent,
    AttributeSensitive,
    AttributeValueInvalid,
    OperationActive,
    OperationNotInitialized,
    CryptokiNotInitialized,
    GeneralError,
    Other(u64),
}

impl ReturnValue {
    pub fn code(self) -> u64 {
        match self {
            ReturnValue::GeneralError => 0x0005,
            ReturnValue::AttributeSensitive => 0x0011,
            ReturnValue::AttributeValueInvalid => 0x0013,
            ReturnValue::DataInvalid => 0x0020,
            ReturnValue::DataLenRange => 0x0021,
            ReturnValue::EncryptedDataInvalid => 0x0040,
            ReturnValue::EncryptedDataLenRange => 0x0041,
            ReturnValue::FunctionNotSupported => 0x0054,
            ReturnValue::KeyTypeInconsistent => 0x0063,
            ReturnValue::KeyFunctionNotPermitted => 0x0068,
            ReturnValue::MechanismInvalid => 0x0070,
            ReturnValue::MechanismParamInvalid => 0x0071,
            ReturnValue::ObjectHandleInvalid => 0x0082,
            ReturnValue::OperationActive => 0x0090,
            ReturnValue::OperationNotInitialized => 0x0091,
            ReturnValue::PinIncorrect => 0x00A0,
            ReturnValue::SessionHandleInvalid => 0x00B3,
            ReturnValue::SignatureInvalid => 0x00C0,
            ReturnValue::SlotIdInvalid => 0x0003,
            ReturnValue::TemplateIncomplete => 0x00D0,
            ReturnValue::TemplateInconsistent => 0x00D1,
            ReturnValue::UserAlreadyLoggedIn => 0x0100,
            ReturnValue::UserNotLoggedIn => 0x0101,
            ReturnValue::CryptokiNotInitialized => 0x0190,
            ReturnValue::Other(code) => code,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ReturnValue::UserAlreadyLoggedIn => "CKR_USER_ALREADY_LOGGED_IN",
            ReturnValue::UserNotLoggedIn => "CKR_USER_NOT_LOGGED_IN",
            ReturnValue::PinIncorrect => "CKR_PIN_INCORRECT",
            ReturnValue::SlotIdInvalid => "CKR_SLOT_ID_INVALID",
            ReturnValue::SessionHandleInvalid => "CKR_SESSION_HANDLE_INVALID",
            ReturnValue::ObjectHandleInvalid => "CKR_OBJECT_HANDLE_INVALID",
            ReturnValue::MechanismInvalid => "CKR_MECHANISM_INVALID",
            ReturnValue::MechanismParamInvalid => "CKR_MECHANISM_PARAM_INVALID",
            ReturnValue::KeyTypeInconsistent => "CKR_KEY_TYPE_INCONSISTENT",
            ReturnValue::KeyFunctionNotPermitted => "CKR_KEY_FUNCTION_NOT_PERMITTED",
            ReturnValue::FunctionNotSupported => "CKR_FUNCTION_NOT_SUPPORTED",
            ReturnValue::DataLenRange => "CKR_DATA_LEN_RANGE",
            ReturnValue::DataInvalid => "CKR_DATA_INVALID",
            ReturnValue::EncryptedDataInvalid => "CKR_ENCRYPTED_DATA_INVALID",
            ReturnValue::EncryptedDataLenRange => "CKR_ENCRYPTED_DATA_LEN_RANGE",
            ReturnValue::SignatureInvalid => "CKR_SIGNATURE_INVALID",
            ReturnValue::TemplateIncomplete => "CKR_TEMPLATE_INCOMPLETE",
            ReturnValue::TemplateInconsistent => "CKR_TEMPLATE_INCONSISTENT",
            ReturnValue::AttributeSensitive => "CKR_ATTRIBUTE_SENSITIVE",
            ReturnValue::AttributeValueInvalid => "CKR_ATTRIBUTE_VALUE_INVALID",
            ReturnValue::OperationActive => "CKR_OPERATION_ACTIVE",
            ReturnValue::OperationNotInitialized => "CKR_OPERATION_NOT_INITIALIZED",
            ReturnValue::CryptokiNotInitialized => "CKR_CRYPTOKI_NOT_INITIALIZED",
            ReturnValue::GeneralError => "CKR_GENERAL_ERROR",
            ReturnValue::Other(_) => "CKR_VENDOR_OR_UNKNOWN",
        }
    }
}

impl fmt::Display for ReturnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReturnValue::Other(code) => write!(f, "CK_RV {code:#x}"),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{function} returned {rv}")]
    Rv {
        function: &'static str,
        rv: ReturnValue,
    },
    #[error("token module error: {0}")]
    Module(String),
}

impl BackendError {
    pub fn rv(function: &'static str, rv: ReturnValue) -> Self {
        Self::Rv { function, rv }
    }

    pub fn module<E: fmt::Display>(err: E) -> Self {
        Self::Module(err.to_string())
    }

    pub fn return_value(&self) -> Option<ReturnValue> {
        match self {
            BackendError::Rv { rv, .. } => Some(*rv),
            BackendError::Module(_) => None,
        }
    }

    pub fn is_already_logged_in(&self) -> bool {
        self.return_value() == Some(ReturnValue::UserAlreadyLoggedIn)
    }

    /// The token refused the mechanism itself (or its use with this key), as opposed to
    /// rejecting the data. Only these rejections may trigger a mode fallback.
    pub fn is_mechanism_rejection(&self) -> bool {
        matches!(
            self.return_value(),
            Some(
                ReturnValue::MechanismInvalid
                    | ReturnValue::MechanismParamInvalid
                    | ReturnValue::KeyTypeInconsistent
                    | ReturnValue::KeyFunctionNotPermitted
                    | ReturnValue::FunctionNotSupported
            )
        )
    }
}

/// Operations the engine needs from a token. Object handles are only meaningful within the
/// session that produced them.
pub trait TokenBackend: Send + Sync {
    /// Short identifier used in logs.
    fn id(&self) -> &'static str;

    fn initialize(&self) -> BackendResult<()>;
    fn finalize(&self) -> BackendResult<()>;
    fn mechanisms(&self, slot: SlotId) -> BackendResult<Vec<MechanismType>>;

    fn open_session(&self, slot: SlotId) -> BackendResult<SessionHandle>;
    fn close_session(&self, session: SessionHandle) -> BackendResult<()>;
    fn close_all_sessions(&self, slot: SlotId) -> BackendResult<()>;
    fn login(&self, session: SessionHandle, pin: &SecretString) -> BackendResult<()>;
    fn logout(&self, session: SessionHandle) -> BackendResult<()>;

    fn find_objects_init(
        &self,
        session: SessionHandle,
        template: &AttributeTemplate,
    ) -> BackendResult<()>;
    fn find_objects(&self, session: SessionHandle, max: usize) -> BackendResult<Vec<ObjectHandle>>;
    fn find_objects_final(&self, session: SessionHandle) -> BackendResult<()>;

    fn create_object(
        &self,
        session: SessionHandle,
        template: &AttributeTemplate,
    ) -> BackendResult<ObjectHandle>;
    fn destroy_object(&self, session: SessionHandle, object: ObjectHandle) -> BackendResult<()>;
    /// Read the requested attributes; unavailable or sensitive ones are omitted from the set.
    fn get_attributes(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        attributes: &[AttributeId],
    ) -> BackendResult<AttributeSet>;

    fn generate_key(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        template: &AttributeTemplate,
    ) -> BackendResult<ObjectHandle>;
    fn generate_key_pair(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        public_template: &AttributeTemplate,
        private_template: &AttributeTemplate,
    ) -> BackendResult<(ObjectHandle, ObjectHandle)>;

    fn encrypt(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        key: ObjectHandle,
        data: &[u8],
    ) -> BackendResult<Vec<u8>>;
    fn decrypt(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        key: ObjectHandle,
        data: &[u8],
    ) -> BackendResult<SecretBytes>;
    fn sign(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        key: ObjectHandle,
        data: &[u8],
    ) -> BackendResult<Vec<u8>>;
    fn verify(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        key: ObjectHandle,
        data: &[u8],
        signature: &[u8],
    ) -> BackendResult<()>;
}
