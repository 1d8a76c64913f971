use axum::response::Html;

const LANDING: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>match-asset-kit</title>
</head>
<body>
<main>
<h1>match-asset-kit</h1>
<p>Upload match footage with its tracking and event files, then follow processing live.</p>
<ul>
<li><code>POST /assets</code> ingest a match</li>
<li><code>GET /assets</code> browse by team, competition or date</li>
<li><code>GET /ws</code> state change feed</li>
</ul>
<p><a href="/swagger-ui/">OpenAPI reference</a></p>
</main>
</body>
</html>
"#;

#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Landing page with links to the API reference", content_type = "text/html")
    ),
    tag = "General"
)]
pub async fn root() -> Html<&'static str> {
    Html(LANDING)
}
