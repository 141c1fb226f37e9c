use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde::Serialize;

use crate::error::AppError;
use crate::session::{is_valid_name, CellEntry, DocumentInfo};
use crate::AppState;

/// Current cells of an open spreadsheet
#[derive(Debug, Serialize)]
pub struct SpreadsheetCells {
    pub name: String,
    pub cells: Vec<CellEntry>,
}

/// List open spreadsheets
async fn list_spreadsheets(State(state): State<AppState>) -> Json<Vec<DocumentInfo>> {
    Json(state.sessions.open_documents().await)
}

/// Get the non-empty cells of an open spreadsheet
async fn get_cells(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<SpreadsheetCells>, AppError> {
    if !is_valid_name(&name) {
        return Err(AppError::BadRequest(format!("Invalid spreadsheet name '{}'", name)));
    }

    let cells = state
        .sessions
        .document_cells(&name)
        .await
        .ok_or_else(|| AppError::NotFound(format!("Spreadsheet {} is not open", name)))?;

    Ok(Json(SpreadsheetCells { name, cells }))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/spreadsheets", get(list_spreadsheets))
        .route("/api/spreadsheets/:name/cells", get(get_cells))
}
