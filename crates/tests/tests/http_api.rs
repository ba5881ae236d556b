use std::fs;
use std::io::{Cursor, Read};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::Extension;
use axum::extract::connect_info::ConnectInfo;
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, AUTHORIZATION, CONTENT_DISPOSITION, CONTENT_TYPE, ORIGIN,
};
use axum::http::{Method, Request, Response, StatusCode};
use pkgserve::server::serve_on;
use pkgserve::{AdminAuth, AllowedOrigins, ServerConfig, ServerState, router};
use pkgserve_core::{PackageService, StoreConfig};
use serde_json::{Value, json};
use serial_test::serial;
use tempfile::TempDir;
use tower::ServiceExt;
use zip::ZipArchive;

const LOOPBACK: [u8; 4] = [127, 0, 0, 1];
const REMOTE: [u8; 4] = [10, 0, 0, 7];

struct Fixture {
    temp: TempDir,
    service: Arc<PackageService>,
}

impl Fixture {
    fn new(packages: &[&str]) -> Result<Self> {
        let temp = TempDir::new()?;
        for dir in packages {
            add_package(temp.path(), dir)?;
        }
        let service = Arc::new(PackageService::new(
            StoreConfig::new(temp.path()).with_refresh_interval(Duration::from_secs(3600)),
        ));
        Ok(Self { temp, service })
    }

    fn root(&self) -> &Path {
        self.temp.path()
    }

    fn app(&self) -> Router {
        self.app_with(AllowedOrigins::Any, AdminAuth::default(), LOOPBACK)
    }

    fn app_with(&self, origins: AllowedOrigins, admin: AdminAuth, peer: [u8; 4]) -> Router {
        let state = ServerState {
            service: Arc::clone(&self.service),
            admin,
        };
        router(state, "/", origins).layer(Extension(ConnectInfo(SocketAddr::from((peer, 50_000)))))
    }
}

fn add_package(root: &Path, dir: &str) -> Result<()> {
    let path = root.join(dir);
    fs::create_dir_all(path.join("src"))?;
    fs::write(path.join("package.json"), format!(r#"{{"id":"{dir}"}}"#))?;
    fs::write(path.join("src/index.js"), "module.exports = {};\n")?;
    Ok(())
}

fn query(action: &str, pkg: &str) -> Request<Body> {
    json_request(json!({ "action": action, "pkg": pkg }))
}

fn json_request(body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::GET)
        .uri("/")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_bytes(response: Response<Body>) -> Result<Vec<u8>> {
    Ok(to_bytes(response.into_body(), usize::MAX).await?.to_vec())
}

async fn body_json(response: Response<Body>) -> Result<Value> {
    Ok(serde_json::from_slice(&body_bytes(response).await?)?)
}

async fn expect_envelope(
    app: Router,
    request: Request<Body>,
    status: StatusCode,
    outcome: &str,
    info: &str,
) -> Result<()> {
    let response = app.oneshot(request).await?;
    assert_eq!(response.status(), status);
    assert_eq!(
        body_json(response).await?,
        json!({ "status": outcome, "info": info })
    );
    Ok(())
}

#[tokio::test]
async fn check_reports_latest_version() -> Result<()> {
    let fixture = Fixture::new(&["foo@1.0.0", "foo@2.0.0"])?;
    expect_envelope(
        fixture.app(),
        query("check", "foo"),
        StatusCode::OK,
        "success",
        "2.0.0",
    )
    .await?;
    assert!(!fixture.root().join("foo@2.0.0.zip").exists());
    Ok(())
}

#[tokio::test]
async fn fetch_streams_zip_and_reuses_archive() -> Result<()> {
    let fixture = Fixture::new(&["foo@1.0.0", "foo@2.0.0"])?;
    let archive = fixture.root().join("foo@1.0.0.zip");

    let response = fixture.app().oneshot(query("fetch", "foo@1.0.0")).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_TYPE], "application/zip");
    assert_eq!(
        response.headers()[CONTENT_DISPOSITION],
        "attachment; filename=foo@1.0.0.zip"
    );
    let first = body_bytes(response).await?;
    assert!(archive.is_file());
    let built_at = fs::metadata(&archive)?.modified()?;

    let mut zip = ZipArchive::new(Cursor::new(first.clone()))?;
    let mut manifest = String::new();
    zip.by_name("package.json")?.read_to_string(&mut manifest)?;
    assert_eq!(manifest, r#"{"id":"foo@1.0.0"}"#);
    assert!(zip.by_name("src/index.js").is_ok());

    let response = fixture.app().oneshot(query("fetch", "foo@1.0.0")).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await?, first);
    assert_eq!(fs::metadata(&archive)?.modified()?, built_at);
    Ok(())
}

#[tokio::test]
async fn fetch_without_version_serves_latest() -> Result<()> {
    let fixture = Fixture::new(&["foo@1.0.0", "foo@2.0.0"])?;
    let response = fixture.app().oneshot(query("fetch", "foo")).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[CONTENT_DISPOSITION],
        "attachment; filename=foo@2.0.0.zip"
    );
    Ok(())
}

#[tokio::test]
async fn lookups_report_not_found() -> Result<()> {
    let fixture = Fixture::new(&["foo@1.0.0"])?;
    expect_envelope(
        fixture.app(),
        query("fetch", "unknown"),
        StatusCode::NOT_FOUND,
        "error",
        "Package not found",
    )
    .await?;
    expect_envelope(
        fixture.app(),
        query("check", "unknown"),
        StatusCode::NOT_FOUND,
        "error",
        "Package not found",
    )
    .await?;
    expect_envelope(
        fixture.app(),
        query("fetch", "foo@9.9.9"),
        StatusCode::NOT_FOUND,
        "error",
        "Version not found",
    )
    .await?;
    Ok(())
}

#[tokio::test]
async fn malformed_requests_are_rejected() -> Result<()> {
    let fixture = Fixture::new(&["foo@1.0.0"])?;

    let plain = Request::builder()
        .method(Method::GET)
        .uri("/")
        .header(CONTENT_TYPE, "text/plain")
        .body(Body::from(r#"{"action":"check","pkg":"foo"}"#))?;
    let no_type = Request::builder()
        .method(Method::GET)
        .uri("/")
        .body(Body::from(r#"{"action":"check","pkg":"foo"}"#))?;
    let broken = Request::builder()
        .method(Method::GET)
        .uri("/")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))?;

    let requests = [
        plain,
        no_type,
        broken,
        json_request(json!({ "action": "check" })),
        json_request(json!({ "pkg": "foo" })),
        json_request(json!({ "action": "", "pkg": "foo" })),
        json_request(json!({ "action": "check", "pkg": "" })),
        json_request(json!({ "action": "check", "pkg": 7 })),
        query("publish", "foo"),
    ];
    for request in requests {
        expect_envelope(
            fixture.app(),
            request,
            StatusCode::BAD_REQUEST,
            "error",
            "Invalid request",
        )
        .await?;
    }
    Ok(())
}

#[tokio::test]
async fn charset_parameter_is_accepted() -> Result<()> {
    let fixture = Fixture::new(&["foo@1.0.0"])?;
    let request = Request::builder()
        .method(Method::GET)
        .uri("/")
        .header(CONTENT_TYPE, "application/json; charset=utf-8")
        .body(Body::from(r#"{"action":"check","pkg":"foo"}"#))?;
    expect_envelope(fixture.app(), request, StatusCode::OK, "success", "1.0.0").await
}

#[tokio::test]
async fn empty_package_name_is_rejected() -> Result<()> {
    let fixture = Fixture::new(&["foo@1.0.0"])?;
    expect_envelope(
        fixture.app(),
        query("fetch", "@1.0.0"),
        StatusCode::BAD_REQUEST,
        "error",
        "Invalid package name",
    )
    .await
}

#[tokio::test]
async fn missing_storage_root_reports_unavailable() -> Result<()> {
    let temp = TempDir::new()?;
    let service = Arc::new(PackageService::new(StoreConfig::new(
        temp.path().join("absent"),
    )));
    let state = ServerState {
        service,
        admin: AdminAuth::default(),
    };
    let app = router(state, "/", AllowedOrigins::Any);
    expect_envelope(
        app,
        query("check", "foo"),
        StatusCode::SERVICE_UNAVAILABLE,
        "error",
        "Storage unavailable",
    )
    .await
}

#[tokio::test]
async fn new_packages_wait_for_refresh() -> Result<()> {
    let fixture = Fixture::new(&["foo@1.0.0"])?;
    expect_envelope(
        fixture.app(),
        query("check", "foo"),
        StatusCode::OK,
        "success",
        "1.0.0",
    )
    .await?;

    add_package(fixture.root(), "bar@0.3.0")?;
    add_package(fixture.root(), "foo@1.1.0")?;
    expect_envelope(
        fixture.app(),
        query("check", "bar"),
        StatusCode::NOT_FOUND,
        "error",
        "Package not found",
    )
    .await?;

    let reload = Request::builder()
        .method(Method::POST)
        .uri("/admin/index/reload")
        .body(Body::empty())?;
    let response = fixture.app().oneshot(reload).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await?,
        json!({ "status": "success", "packages": 2 })
    );

    expect_envelope(
        fixture.app(),
        query("check", "bar"),
        StatusCode::OK,
        "success",
        "0.3.0",
    )
    .await?;
    expect_envelope(
        fixture.app(),
        query("check", "foo"),
        StatusCode::OK,
        "success",
        "1.1.0",
    )
    .await
}

#[tokio::test]
async fn admin_reload_is_guarded() -> Result<()> {
    let fixture = Fixture::new(&["foo@1.0.0"])?;
    let reload = || {
        Request::builder()
            .method(Method::POST)
            .uri("/admin/index/reload")
    };

    let remote = fixture.app_with(AllowedOrigins::Any, AdminAuth::default(), REMOTE);
    let response = remote.oneshot(reload().body(Body::empty())?).await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let tokened = fixture.app_with(AllowedOrigins::Any, AdminAuth::with_token("s3cret"), REMOTE);
    let response = tokened
        .clone()
        .oneshot(reload().body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = tokened
        .clone()
        .oneshot(
            reload()
                .header(AUTHORIZATION, "Bearer wrong")
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = tokened
        .oneshot(
            reload()
                .header(AUTHORIZATION, "Bearer s3cret")
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn cors_allows_everything_by_default() -> Result<()> {
    let fixture = Fixture::new(&["foo@1.0.0"])?;
    let response = fixture.app().oneshot(query("check", "foo")).await?;
    let headers = response.headers();
    assert_eq!(headers[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    assert_eq!(headers[ACCESS_CONTROL_ALLOW_METHODS], "GET");
    assert_eq!(headers[ACCESS_CONTROL_ALLOW_HEADERS], "Origin, Content-Type");
    assert_eq!(headers[ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");

    let response = fixture.app().oneshot(query("fetch", "nope")).await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    Ok(())
}

#[tokio::test]
async fn cors_allow_list_echoes_known_origins() -> Result<()> {
    let fixture = Fixture::new(&["foo@1.0.0"])?;
    let app = fixture.app_with(
        AllowedOrigins::hosts(["example.com"]),
        AdminAuth::default(),
        LOOPBACK,
    );

    let mut request = query("check", "foo");
    request
        .headers_mut()
        .insert(ORIGIN, "https://example.com:8443".parse()?);
    let response = app.clone().oneshot(request).await?;
    assert_eq!(
        response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN],
        "https://example.com:8443"
    );

    let mut request = query("check", "foo");
    request
        .headers_mut()
        .insert(ORIGIN, "https://elsewhere.test".parse()?);
    let response = app.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
    assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_METHODS], "GET");

    let response = app.oneshot(query("check", "foo")).await?;
    assert!(response.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
    Ok(())
}

#[tokio::test]
async fn preflight_answers_no_content() -> Result<()> {
    let fixture = Fixture::new(&[])?;
    let request = Request::builder()
        .method(Method::OPTIONS)
        .uri("/")
        .header(ORIGIN, "http://localhost:3000")
        .body(Body::empty())?;
    let response = fixture.app().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    assert_eq!(
        response.headers()[ACCESS_CONTROL_ALLOW_HEADERS],
        "Origin, Content-Type"
    );
    Ok(())
}

#[tokio::test]
async fn healthz_reports_index_state() -> Result<()> {
    let fixture = Fixture::new(&["foo@1.0.0", "foo@2.0.0", "bar@0.1.0"])?;
    let healthz = || Request::builder().uri("/healthz").body(Body::empty());

    let report = body_json(fixture.app().oneshot(healthz()?).await?).await?;
    assert_eq!(report["status"], "degraded");
    assert_eq!(report["last_refresh"], Value::Null);

    fixture.service.refresh().await?;
    let response = fixture.app().oneshot(healthz()?).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let report = body_json(response).await?;
    assert_eq!(report["status"], "ok");
    assert_eq!(report["packages"], 2);
    assert!(report["last_refresh"].is_string());
    assert_eq!(report["last_error"], Value::Null);
    Ok(())
}

#[tokio::test]
async fn serves_over_tcp() -> Result<()> {
    let fixture = Fixture::new(&["foo@1.0.0", "foo@1.2.0"])?;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = ServerState {
        service: Arc::clone(&fixture.service),
        admin: AdminAuth::default(),
    };
    let server = tokio::spawn(serve_on(listener, router(state, "/", AllowedOrigins::Any)));

    let client = reqwest::Client::new();
    let url = format!("http://{addr}/");
    let response = client
        .get(&url)
        .json(&json!({ "action": "check", "pkg": "foo" }))
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: Value = response.json().await?;
    assert_eq!(body, json!({ "status": "success", "info": "1.2.0" }));

    let response = client
        .get(&url)
        .json(&json!({ "action": "fetch", "pkg": "foo@1.0.0" }))
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let bytes = response.bytes().await?;
    assert!(ZipArchive::new(Cursor::new(bytes.to_vec()))?.len() >= 2);

    let response = client
        .post(format!("http://{addr}/admin/index/reload"))
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    server.abort();
    Ok(())
}

#[tokio::test]
#[serial]
async fn build_uses_environment_store_config() -> Result<()> {
    let temp = TempDir::new()?;
    add_package(temp.path(), "foo@1.0.0")?;
    let _root = EnvGuard::set("PKGSERVE_ROOT", temp.path().to_string_lossy());
    let _refresh = EnvGuard::set("PKGSERVE_REFRESH", "5m");

    let cfg = ServerConfig::from_env()?.with_port(0);
    assert_eq!(cfg.store.refresh_interval, Duration::from_secs(300));
    let server = pkgserve::build(&cfg).await?;
    assert_eq!(server.addr().port(), 0);
    Ok(())
}

#[tokio::test]
#[serial]
async fn build_fails_on_missing_storage_root() -> Result<()> {
    let temp = TempDir::new()?;
    let _root = EnvGuard::set(
        "PKGSERVE_ROOT",
        temp.path().join("absent").to_string_lossy(),
    );

    let cfg = ServerConfig::from_env()?;
    let err = match pkgserve::build(&cfg).await {
        Ok(_) => anyhow::bail!("startup must fail without a storage root"),
        Err(err) => err,
    };
    assert!(format!("{err:#}").contains("initial package scan"));
    Ok(())
}

struct EnvGuard {
    key: &'static str,
    prev: Option<String>,
}

impl EnvGuard {
    fn set(key: &'static str, value: impl AsRef<str>) -> Self {
        let prev = std::env::var(key).ok();
        unsafe {
            std::env::set_var(key, value.as_ref());
        }
        Self { key, prev }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        if let Some(ref value) = self.prev {
            unsafe {
                std::env::set_var(self.key, value);
            }
        } else {
            unsafe {
                std::env::remove_var(self.key);
            }
        }
    }
}
