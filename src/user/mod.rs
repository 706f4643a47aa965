//! Users and e-mail verification

pub mod models;
pub mod tx;

pub use models::{
    CreateUserParams, CreateVerifyEmailParams, UpdateUserParams, UpdateVerifyEmailParams, User,
    VerifyEmail,
};
pub use tx::{
    AfterCreateHook, CreateUserTxParams, CreateUserTxResult, VerifyEmailTxResult,
    new_verify_email,
};
