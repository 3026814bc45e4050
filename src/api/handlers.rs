use crate::api::{AppState, Params};
use crate::error::{Result, SearchEngineError};
use crate::search::chart::DEFAULT_PAGE_SIZE;
use crate::search::{ChartRequest, ChartType, RelatedRequest, TypingRequest};
use axum::{
    Json,
    extract::{Query, State},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// `GET /api/typing?field=&query=&selected=&index=`
pub async fn typing(
    State(state): State<AppState>,
    Query(raw): Query<HashMap<String, String>>,
) -> Result<Response> {
    let params = Params::new(raw);
    let request = TypingRequest::new(
        params.required("field")?,
        params.raw("query").unwrap_or_default(),
        params.selection()?,
        params.index()?,
    )?;
    if params.wants_raw() {
        return Ok(Json(state.search.typing_raw(&request).await?).into_response());
    }
    Ok(Json(state.search.typing(&request).await?).into_response())
}

/// `GET /api/related?empty=&selected=&index=`
pub async fn related(
    State(state): State<AppState>,
    Query(raw): Query<HashMap<String, String>>,
) -> Result<Response> {
    let params = Params::new(raw);
    let empty = params
        .raw("empty")
        .ok_or_else(|| SearchEngineError::argument("\"empty\" is required"))?;
    let request = RelatedRequest::parse(empty, params.selection()?, params.index()?)?;
    if params.wants_raw() {
        return Ok(Json(state.search.related_raw(&request).await?).into_response());
    }
    Ok(Json(state.search.related(&request).await?).into_response())
}

/// `GET /api/chart?type=&query[<field>]=&page=&pageSize=&after=&sort=&index=`
pub async fn chart(
    State(state): State<AppState>,
    Query(raw): Query<HashMap<String, String>>,
) -> Result<Response> {
    let params = Params::new(raw);
    let mut request = ChartRequest::new(ChartType::parse(params.required("type")?)?)
        .page(
            params.number("page", 0)?,
            params.number("pageSize", DEFAULT_PAGE_SIZE)?,
        )
        .after(params.get("after").map(str::to_string))
        .sort(params.get("sort").map(str::to_string))
        .index(params.index()?);
    for (field, value) in params.filters() {
        request = request.filter(field, value);
    }
    if params.wants_raw() {
        return Ok(Json(state.search.chart_raw(&request).await?).into_response());
    }
    Ok(Json(state.search.chart(&request).await?).into_response())
}

#[cfg(test)]
mod tests {
    use crate::api::{AppState, build_router};
    use crate::engine::{MemoryGateway, SearchGateway};
    use crate::schema::SearchDocument;
    use crate::search::SearchService;
    use crate::types::IndexName;
    use axum::Router;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn app() -> Router {
        let gateway = Arc::new(MemoryGateway::with_schemas());
        let docs: Vec<SearchDocument> = [
            ("1", "Queen", "Bohemian Rhapsody", "A Night at the Opera"),
            ("2", "Queen", "Killer Queen", "Sheer Heart Attack"),
            ("3", "Queens of the Stone Age", "No One Knows", "Songs for the Deaf"),
        ]
        .into_iter()
        .map(|(id, artist, song, release)| {
            let mut doc = SearchDocument::with_id(id);
            doc.insert("artist_name", artist);
            doc.insert("song_name", song);
            doc.insert("release_title", release);
            doc
        })
        .collect();
        gateway.bulk(IndexName::Spins, &docs).await.unwrap();
        build_router(AppState::new(SearchService::new(gateway, 10)))
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get(app().await, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_typing_groups_by_value() {
        let (status, body) = get(app().await, "/api/typing?field=artist_name&query=quee").await;
        assert_eq!(status, StatusCode::OK);
        let values: Vec<&str> = body["suggestions"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["value"].as_str().unwrap())
            .collect();
        assert!(values.contains(&"Queen"));
        assert_eq!(values.iter().filter(|v| **v == "Queen").count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_field_is_bad_request() {
        let (status, body) = get(app().await, "/api/typing?field=composer&query=bach").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("composer"));
    }

    #[tokio::test]
    async fn test_related_requires_empty_param() {
        let uri = "/api/related?selected=%7B%22artist_name%22%3A%22Queen%22%7D";
        let (status, _) = get(app().await, uri).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = get(app().await, &format!("{}&empty=song_name", uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["fields"]["song_name"]["suggestions"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_chart_with_filter_and_meta() {
        let uri = "/api/chart?type=songs&query%5Bartist_name%5D=queen";
        let (status, body) = get(app().await, uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pagination"]["mode"], "offset");
        assert!(!body["rows"].as_array().unwrap().is_empty());

        let (status, body) = get(app().await, &format!("{}&meta=1", uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["hits"]["hits"].is_array());
    }

    #[tokio::test]
    async fn test_huge_page_is_bad_request() {
        for uri in [
            "/api/chart?type=songs&page=18446744073709551615",
            "/api/chart?type=artists&sort=count&page=18446744073709551615",
            "/api/chart?type=songs&page=99999999999999999999999",
        ] {
            let (status, body) = get(app().await, uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
            assert!(body["error"].is_string());
        }
    }

    #[tokio::test]
    async fn test_unknown_chart_type() {
        let (status, _) = get(app().await, "/api/chart?type=labels").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
