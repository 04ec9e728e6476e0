//! Request handlers and DTOs for the relay's HTTP surface.

use std::sync::Arc;

use axum::{
    extract::{Path, Query},
    http::StatusCode,
    response::Json,
    Extension,
};
use log::error;
use serde::{Deserialize, Serialize};

use crate::bundles::{aggregate_legal, gen_bounds, Bundle};
use crate::database::Database;
use crate::error::RelayError;
use crate::saves::{Save, SearchFilter};
use crate::utils::{CodeKind, Utils};
use crate::verify::Verifier;

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub verifier: Arc<dyn Verifier>,
}

#[derive(Debug, Deserialize)]
pub struct PageParams {
    pub page: Option<u32>,
    pub amount: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchRequest {
    #[serde(default)]
    pub generations: Vec<String>,
    #[serde(default)]
    pub legal_only: bool,
    /// "latest" (default) or "popularity"
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub descending: bool,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse<T> {
    pub total: i64,
    pub page: u32,
    pub pages: u32,
    pub items: Vec<T>,
}

#[derive(Debug, Deserialize)]
pub struct UploadSaveRequest {
    pub payload: String,
    pub generation: String,
}

#[derive(Debug, Deserialize)]
pub struct UploadBundleRequest {
    pub saves: Vec<UploadSaveRequest>,
}

#[derive(Debug, Serialize)]
pub struct CodeResponse {
    pub code: String,
}

const MAX_BUNDLE_SAVES: usize = 6;

/// Clients may send marketing names for sub-generation releases; storage uses
/// the dotted tags.
fn normalize_generation(tag: &str) -> Option<String> {
    match tag {
        "LGPE" => Some("7.1".to_string()),
        "BDSP" => Some("8.2".to_string()),
        "PLA" => Some("9.1".to_string()),
        other => {
            if other.parse::<u32>().is_ok() {
                Some(other.to_string())
            } else {
                None
            }
        }
    }
}

fn filter_from_request(request: &SearchRequest) -> SearchFilter {
    SearchFilter {
        generations: request
            .generations
            .iter()
            .filter_map(|tag| normalize_generation(tag))
            .collect(),
        legal_only: request.legal_only,
        sort_by_popularity: request.sort.as_deref() == Some("popularity"),
        descending: request.descending,
    }
}

fn pages_for(total: i64, limit: u32) -> u32 {
    if total <= 0 {
        0
    } else {
        ((total as u64).div_ceil(limit as u64)) as u32
    }
}

pub async fn search_saves(
    Extension(state): Extension<AppState>,
    Query(params): Query<PageParams>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse<Save>>, StatusCode> {
    let page = params.page.unwrap_or(1).max(1);
    let limit = params.amount.unwrap_or(30).clamp(1, 100);

    let conn = state
        .db
        .conn()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let filter = filter_from_request(&request);

    let (total, items) = Save::search(&conn, &filter, page, limit).map_err(|e| {
        error!("Failed to search saves: {e}");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(SearchResponse {
        total,
        page,
        pages: pages_for(total, limit),
        items,
    }))
}

pub async fn search_bundles(
    Extension(state): Extension<AppState>,
    Query(params): Query<PageParams>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse<Bundle>>, StatusCode> {
    let page = params.page.unwrap_or(1).max(1);
    let limit = params.amount.unwrap_or(5).clamp(1, 100);

    let conn = state
        .db
        .conn()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let filter = filter_from_request(&request);

    let (total, items) = Bundle::search(&conn, &filter, page, limit).map_err(|e| {
        error!("Failed to search bundles: {e}");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(SearchResponse {
        total,
        page,
        pages: pages_for(total, limit),
        items,
    }))
}

pub async fn upload_save(
    Extension(state): Extension<AppState>,
    Json(request): Json<UploadSaveRequest>,
) -> Result<Json<CodeResponse>, StatusCode> {
    let conn = state
        .db
        .conn()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    // An identical payload resolves to the already-stored record
    if let Some(existing) =
        Save::get_by_payload(&conn, &request.payload).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
    {
        return Ok(Json(CodeResponse {
            code: existing.download_code().to_string(),
        }));
    }

    let reply = state
        .verifier
        .verify(&request.payload, &request.generation)
        .map_err(|e| {
            error!("Legality verification failed during upload: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let code = Database::immediate_transaction(&conn, |c| {
        let code = Utils::generate_download_code(c, CodeKind::Save)?;
        Save::insert(
            c,
            &Utils::now_rfc3339(),
            &code,
            0,
            &request.generation,
            reply.legal,
            &request.payload,
        )?;
        Ok(code)
    })
    .map_err(|e| {
        error!("Failed to store uploaded save: {e}");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(CodeResponse { code }))
}

pub async fn upload_bundle(
    Extension(state): Extension<AppState>,
    Json(request): Json<UploadBundleRequest>,
) -> Result<Json<CodeResponse>, StatusCode> {
    if request.saves.is_empty() || request.saves.len() > MAX_BUNDLE_SAVES {
        return Err(StatusCode::BAD_REQUEST);
    }

    let conn = state
        .db
        .conn()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    // Verify outside the transaction: verification spawns a process per save
    // and must not hold the write lock. Existing payloads skip verification.
    let mut members: Vec<(UploadSaveRequest, Option<Save>, bool)> = Vec::new();
    for save_request in request.saves {
        let existing = Save::get_by_payload(&conn, &save_request.payload)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        let legal = match &existing {
            Some(save) => save.legal(),
            None => {
                let reply = state
                    .verifier
                    .verify(&save_request.payload, &save_request.generation)
                    .map_err(|e| {
                        error!("Legality verification failed during bundle upload: {e}");
                        StatusCode::INTERNAL_SERVER_ERROR
                    })?;
                reply.legal
            }
        };
        members.push((save_request, existing, legal));
    }

    let bundle_legal = aggregate_legal(members.iter().map(|(_, _, legal)| *legal));
    let tags: Vec<String> = members
        .iter()
        .map(|(request, existing, _)| match existing {
            Some(save) => save.generation().to_string(),
            None => request.generation.clone(),
        })
        .collect();
    let (min_gen, max_gen) = gen_bounds(&tags).ok_or(StatusCode::BAD_REQUEST)?;

    let code = Database::immediate_transaction(&conn, |c| {
        let mut save_ids = Vec::new();
        for (save_request, existing, legal) in &members {
            let save_id = match existing {
                Some(save) => save.save_id(),
                None => {
                    let code = Utils::generate_download_code(c, CodeKind::Save)?;
                    Save::insert(
                        c,
                        &Utils::now_rfc3339(),
                        &code,
                        0,
                        &save_request.generation,
                        *legal,
                        &save_request.payload,
                    )?
                }
            };
            save_ids.push(save_id);
        }

        let code = Utils::generate_download_code(c, CodeKind::Bundle)?;
        let bundle_id = Bundle::insert(
            c,
            &Utils::now_rfc3339(),
            &code,
            0,
            bundle_legal,
            &min_gen,
            &max_gen,
        )?;
        for save_id in save_ids {
            Bundle::attach_save(c, bundle_id, save_id)?;
        }
        Ok(code)
    })
    .map_err(|e| {
        error!("Failed to store uploaded bundle: {e}");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(CodeResponse { code }))
}

pub async fn download(
    Extension(state): Extension<AppState>,
    Path((kind, code)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let conn = state
        .db
        .conn()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    match kind.as_str() {
        "saves" => {
            let save = Save::get_by_code(&conn, &code)
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
                .ok_or(StatusCode::NOT_FOUND)?;
            Save::increment_download_count(&conn, save.save_id()).map_err(map_store_error)?;
            Ok(Json(serde_json::json!({})))
        }
        "bundles" => {
            let bundle = Bundle::get_by_code(&conn, &code)
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
                .ok_or(StatusCode::NOT_FOUND)?;
            Bundle::increment_download_counts(&conn, bundle.bundle_id())
                .map_err(map_store_error)?;
            Ok(Json(serde_json::json!({})))
        }
        _ => Err(StatusCode::BAD_REQUEST),
    }
}

fn map_store_error(e: RelayError) -> StatusCode {
    error!("Store update failed: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_generation_aliases() {
        assert_eq!(normalize_generation("LGPE").as_deref(), Some("7.1"));
        assert_eq!(normalize_generation("BDSP").as_deref(), Some("8.2"));
        assert_eq!(normalize_generation("PLA").as_deref(), Some("9.1"));
        assert_eq!(normalize_generation("8").as_deref(), Some("8"));
        assert_eq!(normalize_generation("not-a-gen"), None);
    }

    #[test]
    fn test_pages_for() {
        assert_eq!(pages_for(0, 30), 0);
        assert_eq!(pages_for(1, 30), 1);
        assert_eq!(pages_for(30, 30), 1);
        assert_eq!(pages_for(31, 30), 2);
    }

    #[test]
    fn test_filter_from_request_drops_unknown_tags() {
        let request = SearchRequest {
            generations: vec!["LGPE".to_string(), "junk".to_string(), "9".to_string()],
            legal_only: true,
            sort: Some("popularity".to_string()),
            descending: true,
        };
        let filter = filter_from_request(&request);
        assert_eq!(filter.generations, vec!["7.1".to_string(), "9".to_string()]);
        assert!(filter.legal_only);
        assert!(filter.sort_by_popularity);
        assert!(filter.descending);
    }
}
