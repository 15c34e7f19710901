use axum::response::Html;

const LANDING_PAGE: &str = r#"<!doctype html><html><head><meta charset="utf-8"><title>Service Started - DeepSeek Chat</title></head><body><h1>Service Started</h1></body></html>"#;

pub async fn landing() -> Html<&'static str> {
    Html(LANDING_PAGE)
}
