//! Read-only directory listing.

use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::Result;

/// Public view of a directory user entry.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryUser {
    pub uid: String,
    pub common_name: Option<String>,
    pub display_name: Option<String>,
    pub mail: Option<String>,
}

/// Handler to list user entries known to the directory.
pub async fn handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<DirectoryUser>>> {
    let users = state
        .ldap
        .list_users()
        .await?
        .into_iter()
        .filter_map(|entry| {
            let uid = entry.uid()?.to_owned();
            Some(DirectoryUser {
                uid,
                common_name: entry.first("cn").map(str::to_owned),
                display_name: entry.first("displayName").map(str::to_owned),
                mail: entry.first("mail").map(str::to_owned),
            })
        })
        .collect();

    Ok(Json(users))
}
