use crate::error::{is_constraint_violation, AppError, AppResult};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

/// An authenticated account. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    pub email: String,
}

pub fn normalize_email(raw: &str) -> AppResult<String> {
    let email = raw.trim().to_ascii_lowercase();
    let Some((local, domain)) = email.split_once('@') else {
        return Err(AppError::bad_params("email must contain '@'"));
    };
    if local.is_empty() || domain.is_empty() {
        return Err(AppError::bad_params("email must have a local part and a domain"));
    }
    Ok(email)
}

/// Argon2id with a fresh random salt, encoded as a PHC string.
fn hash_password(password: &str) -> AppResult<String> {
    let salt = SaltString::encode_b64(Uuid::new_v4().as_bytes())
        .map_err(|e| AppError::CredentialStore(e.to_string()))?;
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| AppError::CredentialStore(e.to_string()))?;
    Ok(hash.to_string())
}

fn password_matches(password: &str, stored: &str) -> AppResult<bool> {
    let parsed =
        PasswordHash::new(stored).map_err(|e| AppError::CredentialStore(e.to_string()))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

pub fn sign_up(
    conn: &Connection,
    email: &str,
    password: &str,
    min_password_len: usize,
) -> AppResult<Identity> {
    let email = normalize_email(email)?;
    if password.chars().count() < min_password_len {
        return Err(AppError::bad_params(format!(
            "password must be at least {} characters",
            min_password_len
        )));
    }

    let user_id = Uuid::new_v4().to_string();
    let hash = hash_password(password)?;
    let created_at = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO identities(id, email, password_hash, created_at) VALUES(?, ?, ?, ?)",
        (&user_id, &email, &hash, &created_at),
    )
    .map_err(|e| {
        if is_constraint_violation(&e) {
            AppError::Conflict("an account with this email already exists".into())
        } else {
            AppError::Update(e)
        }
    })?;

    Ok(Identity { user_id, email })
}

/// Unknown email and wrong password are indistinguishable to the caller.
pub fn verify_credentials(
    conn: &Connection,
    email: &str,
    password: &str,
) -> AppResult<Identity> {
    let email = normalize_email(email).map_err(|_| AppError::InvalidCredentials)?;
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT id, password_hash FROM identities WHERE email = ?",
            [&email],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((user_id, stored)) = row else {
        return Err(AppError::InvalidCredentials);
    };
    if !password_matches(password, &stored)? {
        return Err(AppError::InvalidCredentials);
    }
    Ok(Identity { user_id, email })
}

pub fn identity_exists(conn: &Connection, user_id: &str) -> AppResult<bool> {
    Ok(conn
        .query_row("SELECT 1 FROM identities WHERE id = ?", [user_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()?
        .is_some())
}
