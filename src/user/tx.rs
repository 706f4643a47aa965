//! Multi-statement user transactions
//!
//! Same shape as the transfer: a unit of work run by the executor, so any
//! failure inside (including the after-create hook) rolls everything back.

use futures::future::BoxFuture;
use rand::Rng;
use rand::distributions::Alphanumeric;

use super::models::{
    CreateUserParams, CreateVerifyEmailParams, UpdateUserParams, UpdateVerifyEmailParams, User,
    VerifyEmail,
};
use crate::db::{Repository, StoreError};

pub const SECRET_CODE_LEN: usize = 32;

/// Runs with the freshly inserted user before commit, e.g. to enqueue a
/// verification e-mail task. An error aborts the user creation.
pub type AfterCreateHook = Box<dyn FnOnce(User) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

pub struct CreateUserTxParams {
    pub user: CreateUserParams,
    pub after_create: AfterCreateHook,
}

impl CreateUserTxParams {
    pub fn new<F, Fut>(user: CreateUserParams, after_create: F) -> Self
    where
        F: FnOnce(User) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            user,
            after_create: Box::new(move |u| Box::pin(after_create(u))),
        }
    }

    /// No side effect after insert
    pub fn without_hook(user: CreateUserParams) -> Self {
        Self::new(user, |_| async { Ok(()) })
    }
}

#[derive(Debug, Clone)]
pub struct CreateUserTxResult {
    pub user: User,
}

#[derive(Debug, Clone)]
pub struct VerifyEmailTxResult {
    pub user: User,
    pub verify_email: VerifyEmail,
}

pub async fn create_user_in<R>(
    q: &mut R,
    arg: CreateUserTxParams,
) -> Result<CreateUserTxResult, StoreError>
where
    R: Repository + ?Sized,
{
    let user = q.create_user(arg.user).await?;
    (arg.after_create)(user.clone())
        .await
        .map_err(|e| StoreError::Hook(format!("{e:#}")))?;
    Ok(CreateUserTxResult { user })
}

/// Consume the code and flag the owner's address as verified, together.
pub async fn verify_email_in<R>(
    q: &mut R,
    arg: UpdateVerifyEmailParams,
) -> Result<VerifyEmailTxResult, StoreError>
where
    R: Repository + ?Sized,
{
    let verify_email = q.update_verify_email(arg).await?;
    let user = q
        .update_user(UpdateUserParams {
            username: verify_email.username.clone(),
            is_email_verified: Some(true),
            ..Default::default()
        })
        .await?;
    Ok(VerifyEmailTxResult { user, verify_email })
}

pub fn random_secret_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SECRET_CODE_LEN)
        .map(char::from)
        .collect()
}

/// Params for a new verification row with a fresh secret code
pub fn new_verify_email(user: &User) -> CreateVerifyEmailParams {
    CreateVerifyEmailParams {
        username: user.username.clone(),
        email: user.email.clone(),
        secret_code: random_secret_code(),
    }
}
