use crate::auth::Identity;
use crate::error::{AppError, AppResult};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassRef {
    pub id: String,
    pub class_name: String,
    pub year: i64,
    pub section: String,
    pub department: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentProfile {
    pub id: String,
    pub user_id: Option<String>,
    pub full_name: String,
    pub roll_number: String,
    pub email: Option<String>,
    pub class: Option<ClassRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FacultyProfile {
    pub id: String,
    pub user_id: Option<String>,
    pub full_name: String,
    pub email: String,
    pub department: Option<String>,
    pub is_class_advisor: bool,
    pub advisor_class: Option<ClassRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Faculty,
}

/// The profile linked to an identity. Role is implied by the variant.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Profile {
    Student(StudentProfile),
    Faculty(FacultyProfile),
    None,
}

impl Profile {
    pub fn role(&self) -> Option<Role> {
        match self {
            Profile::Student(_) => Some(Role::Student),
            Profile::Faculty(_) => Some(Role::Faculty),
            Profile::None => None,
        }
    }
}

/// Lookups the resolver needs from the profile tables.
pub trait ProfileStore {
    fn student_for_user(&self, user_id: &str) -> rusqlite::Result<Option<StudentProfile>>;
    fn faculty_for_user(&self, user_id: &str) -> rusqlite::Result<Option<FacultyProfile>>;
}

const STUDENT_SELECT: &str = "SELECT s.id, s.user_id, s.full_name, s.roll_number, s.email,
        c.id, c.class_name, c.year, c.section, c.department
     FROM students s
     LEFT JOIN classes c ON c.id = s.class_id";

const FACULTY_SELECT: &str = "SELECT f.id, f.user_id, f.full_name, f.email, f.department,
        f.is_class_advisor, c.id, c.class_name, c.year, c.section, c.department
     FROM faculty f
     LEFT JOIN classes c ON c.id = f.advisor_class_id";

fn class_ref_at(r: &Row<'_>, base: usize) -> rusqlite::Result<Option<ClassRef>> {
    let Some(id) = r.get::<_, Option<String>>(base)? else {
        return Ok(None);
    };
    Ok(Some(ClassRef {
        id,
        class_name: r.get(base + 1)?,
        year: r.get(base + 2)?,
        section: r.get(base + 3)?,
        department: r.get(base + 4)?,
    }))
}

fn student_from_row(r: &Row<'_>) -> rusqlite::Result<StudentProfile> {
    Ok(StudentProfile {
        id: r.get(0)?,
        user_id: r.get(1)?,
        full_name: r.get(2)?,
        roll_number: r.get(3)?,
        email: r.get(4)?,
        class: class_ref_at(r, 5)?,
    })
}

fn faculty_from_row(r: &Row<'_>) -> rusqlite::Result<FacultyProfile> {
    Ok(FacultyProfile {
        id: r.get(0)?,
        user_id: r.get(1)?,
        full_name: r.get(2)?,
        email: r.get(3)?,
        department: r.get(4)?,
        is_class_advisor: r.get::<_, i64>(5)? != 0,
        advisor_class: class_ref_at(r, 6)?,
    })
}

pub fn class_by_id(conn: &Connection, class_id: &str) -> rusqlite::Result<Option<ClassRef>> {
    conn.query_row(
        "SELECT id, class_name, year, section, department FROM classes WHERE id = ?",
        [class_id],
        |r| class_ref_at(r, 0),
    )
    .optional()
    .map(Option::flatten)
}

pub fn student_by_id(
    conn: &Connection,
    student_id: &str,
) -> rusqlite::Result<Option<StudentProfile>> {
    conn.query_row(
        &format!("{} WHERE s.id = ?", STUDENT_SELECT),
        [student_id],
        student_from_row,
    )
    .optional()
}

pub fn faculty_by_id(
    conn: &Connection,
    faculty_id: &str,
) -> rusqlite::Result<Option<FacultyProfile>> {
    conn.query_row(
        &format!("{} WHERE f.id = ?", FACULTY_SELECT),
        [faculty_id],
        faculty_from_row,
    )
    .optional()
}

pub fn list_students(
    conn: &Connection,
    class_id: Option<&str>,
) -> rusqlite::Result<Vec<StudentProfile>> {
    match class_id {
        Some(cid) => {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE s.class_id = ? ORDER BY s.roll_number",
                STUDENT_SELECT
            ))?;
            let rows = stmt
                .query_map([cid], student_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        }
        None => {
            let mut stmt =
                conn.prepare(&format!("{} ORDER BY s.roll_number", STUDENT_SELECT))?;
            let rows = stmt
                .query_map([], student_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        }
    }
}

pub fn list_faculty(conn: &Connection) -> rusqlite::Result<Vec<FacultyProfile>> {
    let mut stmt = conn.prepare(&format!("{} ORDER BY f.full_name", FACULTY_SELECT))?;
    let rows = stmt
        .query_map([], faculty_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

impl ProfileStore for Connection {
    fn student_for_user(&self, user_id: &str) -> rusqlite::Result<Option<StudentProfile>> {
        self.query_row(
            &format!("{} WHERE s.user_id = ?", STUDENT_SELECT),
            [user_id],
            student_from_row,
        )
        .optional()
    }

    fn faculty_for_user(&self, user_id: &str) -> rusqlite::Result<Option<FacultyProfile>> {
        self.query_row(
            &format!("{} WHERE f.user_id = ?", FACULTY_SELECT),
            [user_id],
            faculty_from_row,
        )
        .optional()
    }
}

/// Determines the role of an identity by which profile table holds it.
///
/// No match is not an error: it yields [`Profile::None`]. A match in both
/// tables is rejected instead of picking one.
pub fn resolve<S: ProfileStore + ?Sized>(store: &S, identity: &Identity) -> AppResult<Profile> {
    let student = store
        .student_for_user(&identity.user_id)
        .map_err(AppError::ProfileLoad)?;
    let faculty = store
        .faculty_for_user(&identity.user_id)
        .map_err(AppError::ProfileLoad)?;
    match (student, faculty) {
        (Some(_), Some(_)) => Err(AppError::ProfileConflict {
            user_id: identity.user_id.clone(),
        }),
        (Some(s), None) => Ok(Profile::Student(s)),
        (None, Some(f)) => Ok(Profile::Faculty(f)),
        (None, None) => Ok(Profile::None),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionContext {
    pub identity: Identity,
    pub token: String,
    pub issued_at: String,
    pub profile: Profile,
}

fn new_token() -> String {
    Uuid::new_v4().simple().to_string()
}

impl SessionContext {
    fn issue(identity: Identity, profile: Profile) -> Self {
        SessionContext {
            identity,
            token: new_token(),
            issued_at: chrono::Utc::now().to_rfc3339(),
            profile,
        }
    }

    pub fn role(&self) -> Option<Role> {
        self.profile.role()
    }

    pub fn view(&self) -> serde_json::Value {
        json!({
            "userId": self.identity.user_id,
            "email": self.identity.email,
            "token": self.token,
            "issuedAt": self.issued_at,
            "role": self.role(),
            "profile": self.profile,
        })
    }

    pub fn require_student(&self) -> AppResult<&StudentProfile> {
        match &self.profile {
            Profile::Student(s) => Ok(s),
            Profile::Faculty(_) => Err(AppError::Forbidden("students only".into())),
            Profile::None => Err(AppError::ProfileNotFound),
        }
    }

    pub fn require_faculty(&self) -> AppResult<&FacultyProfile> {
        match &self.profile {
            Profile::Faculty(f) => Ok(f),
            Profile::Student(_) => Err(AppError::Forbidden("faculty only".into())),
            Profile::None => Err(AppError::ProfileNotFound),
        }
    }
}

#[derive(Debug, Clone)]
pub enum AuthEvent {
    SignedIn(Identity),
    TokenRefreshed(Identity),
    SignedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub resolved: bool,
}

/// Explicit session lifecycle: empty at start, changed only by auth events.
#[derive(Debug, Default)]
pub struct SessionState {
    current: Option<SessionContext>,
}

impl SessionState {
    pub fn current(&self) -> Option<&SessionContext> {
        self.current.as_ref()
    }

    pub fn require(&self) -> AppResult<&SessionContext> {
        self.current.as_ref().ok_or(AppError::NotAuthenticated)
    }

    pub fn clear(&mut self) {
        if let Some(prev) = self.current.take() {
            tracing::info!(user_id = %prev.identity.user_id, "session torn down");
        }
    }

    /// Applies an auth transition. On error the previous state is kept.
    pub fn apply<S: ProfileStore + ?Sized>(
        &mut self,
        store: &S,
        event: AuthEvent,
    ) -> AppResult<Transition> {
        match event {
            AuthEvent::SignedIn(identity) => {
                self.establish(store, identity)?;
                Ok(Transition { resolved: true })
            }
            AuthEvent::TokenRefreshed(identity) => {
                let same_identity = self
                    .current
                    .as_ref()
                    .is_some_and(|cur| cur.identity == identity);
                if !same_identity {
                    self.establish(store, identity)?;
                    return Ok(Transition { resolved: true });
                }
                if let Some(cur) = self.current.as_mut() {
                    cur.token = new_token();
                    cur.issued_at = chrono::Utc::now().to_rfc3339();
                    tracing::debug!(user_id = %identity.user_id, "session token refreshed");
                }
                Ok(Transition { resolved: false })
            }
            AuthEvent::SignedOut => {
                self.clear();
                Ok(Transition { resolved: false })
            }
        }
    }

    fn establish<S: ProfileStore + ?Sized>(
        &mut self,
        store: &S,
        identity: Identity,
    ) -> AppResult<()> {
        let profile = match resolve(store, &identity) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(
                    user_id = %identity.user_id,
                    error = %e,
                    "profile resolution failed"
                );
                return Err(e);
            }
        };
        tracing::info!(
            user_id = %identity.user_id,
            role = ?profile.role(),
            "session established"
        );
        self.current = Some(SessionContext::issue(identity, profile));
        Ok(())
    }
}
