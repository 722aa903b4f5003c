//! 管理操作：按 `param` 分发 POST 请求（上传、追加、删除、移动、建目录、列目录），以及攻击模式重置。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Path, Query};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use futures_util::StreamExt;
use http_body_util::BodyExt;
use serde::Deserialize;
use std::pin::pin;
use std::sync::Arc;
use tracing::{info, warn};

use crate::counter::PersistentCounter;
use crate::error::ApiError;
use crate::guard::RateGuard;
use crate::path::{PathResolver, SafePath};
use crate::site;
use crate::storage::FileStore;
use crate::transfer::TransferEngine;
use crate::upload;

#[derive(Debug)]
pub struct AdminConfig {
    pub password: String,
    /// 单个上传文件的字节上限，0 表示不限制。
    pub max_upload_size: u64,
}

impl AdminConfig {
    pub fn check_password(&self, supplied: Option<&str>) -> Result<(), ApiError> {
        if supplied == Some(self.password.as_str()) {
            Ok(())
        } else {
            Err(ApiError::Forbidden("Password wrong".into()))
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct AdminQuery {
    pub param: Option<String>,
    pub password: Option<String>,
    pub format: Option<String>,
    /// `param=rename` 的目标路径。
    pub to: Option<String>,
}

/// POST 请求入口，未知的 `param` 按普通文件请求处理。
#[allow(clippy::too_many_arguments)]
pub async fn dispatch(
    path: Option<Path<String>>,
    Query(query): Query<AdminQuery>,
    Extension(resolver): Extension<Arc<PathResolver>>,
    Extension(store): Extension<Arc<FileStore>>,
    Extension(admin): Extension<Arc<AdminConfig>>,
    Extension(engine): Extension<Arc<TransferEngine>>,
    Extension(counter): Extension<Arc<PersistentCounter>>,
    request: Request<AxumBody>,
) -> Result<Response, ApiError> {
    let request_path = site::request_path(path);
    let Some(param) = query.param.as_deref() else {
        return Err(ApiError::BadRequest("No param provided.".into()));
    };
    info!(param, path = %request_path, "admin request");

    match param {
        "upload" => {
            admin.check_password(query.password.as_deref())?;
            let dir = resolver.resolve(&request_path);
            upload::upload_into(&resolver, &store, &admin, dir, request).await
        }
        "append" => {
            admin.check_password(query.password.as_deref())?;
            append_body(&store, &admin, &resolver.resolve(&request_path), request).await
        }
        "delete" => {
            admin.check_password(query.password.as_deref())?;
            delete_entry(&store, &resolver.resolve(&request_path)).await
        }
        "rename" => {
            admin.check_password(query.password.as_deref())?;
            let Some(to) = query.to.as_deref() else {
                return Err(ApiError::BadRequest("No destination provided.".into()));
            };
            rename_entry(
                &store,
                &resolver.resolve(&request_path),
                &resolver.resolve(to),
            )
            .await
        }
        "mkdir" => {
            admin.check_password(query.password.as_deref())?;
            create_directory(&store, &resolver.resolve(&request_path)).await
        }
        "ergodic" => {
            let as_json = query.format.as_deref() == Some("json");
            list_directory(&store, &resolver.resolve(&request_path), as_json).await
        }
        _ => {
            site::respond(
                &resolver,
                &store,
                &engine,
                &counter,
                &request_path,
                request.headers(),
            )
            .await
        }
    }
}

/// 清除攻击模式；攻击模式下该路由仍可访问。
pub async fn reset_guard(
    Query(query): Query<AdminQuery>,
    Extension(admin): Extension<Arc<AdminConfig>>,
    Extension(guard): Extension<Arc<RateGuard>>,
) -> Result<Response, ApiError> {
    admin.check_password(query.password.as_deref())?;
    guard.reset().await;
    Ok((StatusCode::OK, "Attack mode cleared").into_response())
}

async fn delete_entry(store: &FileStore, target: &SafePath) -> Result<Response, ApiError> {
    match store.delete(target).await {
        Ok(_) => Ok((StatusCode::OK, "File deleted successfully").into_response()),
        Err(err) if err.is_not_found() => Err(ApiError::NotFound("File not found".into())),
        Err(err) => Err(err.into()),
    }
}

async fn append_body(
    store: &FileStore,
    admin: &AdminConfig,
    target: &SafePath,
    request: Request<AxumBody>,
) -> Result<Response, ApiError> {
    if store.is_dir(target).await {
        return Err(ApiError::BadRequest("path is not a file".into()));
    }
    let mut body = pin!(BodyExt::into_data_stream(request.into_body()));
    let mut content = Vec::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|err| {
            warn!(path = %target, error = %err, "append body interrupted");
            ApiError::BadRequest("upload body interrupted".into())
        })?;
        if admin.max_upload_size > 0
            && (content.len() + chunk.len()) as u64 > admin.max_upload_size
        {
            warn!(path = %target, limit = admin.max_upload_size, "append over size limit");
            return Err(ApiError::PayloadTooLarge);
        }
        content.extend_from_slice(&chunk);
    }
    if content.is_empty() {
        return Err(ApiError::BadRequest("No file content provided".into()));
    }

    store.append(target, &content).await?;
    info!(path = %target, size = content.len(), "content appended");
    Ok((StatusCode::OK, "Content appended successfully").into_response())
}

async fn rename_entry(
    store: &FileStore,
    from: &SafePath,
    to: &SafePath,
) -> Result<Response, ApiError> {
    if from.is_root() || to.is_root() {
        return Err(ApiError::BadRequest("Cannot move the root directory".into()));
    }
    if store.exists(to).await {
        return Err(ApiError::Conflict("Destination already exists".into()));
    }
    match store.rename(from, to).await {
        Ok(()) => {
            info!(from = %from, to = %to, "entry moved");
            Ok((StatusCode::OK, "File moved successfully").into_response())
        }
        Err(err) if err.is_not_found() => Err(ApiError::NotFound("File not found".into())),
        Err(err) => Err(err.into()),
    }
}

async fn create_directory(store: &FileStore, target: &SafePath) -> Result<Response, ApiError> {
    if store.is_dir(target).await {
        return Err(ApiError::Conflict("Directory already exists".into()));
    }
    store.create_dir(target).await?;
    info!(path = %target, "directory created");
    Ok((StatusCode::OK, "Directory created successfully").into_response())
}

async fn list_directory(
    store: &FileStore,
    target: &SafePath,
    as_json: bool,
) -> Result<Response, ApiError> {
    if !store.is_dir(target).await {
        return Err(ApiError::NotFound("Directory not found".into()));
    }
    let entries = store.list_dir(target).await?;
    if as_json {
        return Ok(JsonResponse(entries).into_response());
    }

    let listing: String = entries
        .iter()
        .map(|entry| {
            let suffix = if entry.is_dir { "/" } else { "" };
            format!("{}{suffix}\n", entry.name)
        })
        .collect();
    Ok((StatusCode::OK, listing).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header;
    use tempfile::tempdir;

    struct Fixture {
        _temp: tempfile::TempDir,
        resolver: Arc<PathResolver>,
        store: Arc<FileStore>,
        admin: Arc<AdminConfig>,
        engine: Arc<TransferEngine>,
        counter: Arc<PersistentCounter>,
    }

    fn make_fixture() -> Fixture {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("www");
        std::fs::create_dir_all(&root).expect("create root");
        let store = Arc::new(FileStore::new(temp.path().join("trash")));
        Fixture {
            resolver: Arc::new(PathResolver::new(root)),
            engine: Arc::new(TransferEngine::new(store.clone(), 1024, 0)),
            store,
            admin: Arc::new(AdminConfig {
                password: "secret".into(),
                max_upload_size: 0,
            }),
            counter: Arc::new(PersistentCounter::disabled()),
            _temp: temp,
        }
    }

    impl Fixture {
        async fn post(
            &self,
            path: Option<&str>,
            query: AdminQuery,
            body: AxumBody,
        ) -> Result<Response, ApiError> {
            let request = Request::builder()
                .method("POST")
                .body(body)
                .expect("request");
            dispatch(
                path.map(|path| Path(path.to_string())),
                Query(query),
                Extension(self.resolver.clone()),
                Extension(self.store.clone()),
                Extension(self.admin.clone()),
                Extension(self.engine.clone()),
                Extension(self.counter.clone()),
                request,
            )
            .await
        }

        fn write(&self, path: &str, content: &[u8]) {
            let target = self.resolver.resolve(path);
            if let Some(parent) = target.as_path().parent() {
                std::fs::create_dir_all(parent).expect("create parent");
            }
            std::fs::write(target.as_path(), content).expect("write fixture");
        }
    }

    fn query(param: &str, password: Option<&str>) -> AdminQuery {
        AdminQuery {
            param: Some(param.into()),
            password: password.map(Into::into),
            format: None,
            to: None,
        }
    }

    async fn body_text(response: Response) -> String {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        String::from_utf8(bytes.to_vec()).expect("utf8")
    }

    #[tokio::test]
    async fn missing_param_is_bad_request() {
        let fixture = make_fixture();
        let result = fixture
            .post(Some("a.txt"), AdminQuery::default(), AxumBody::empty())
            .await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn mutations_require_password() {
        let fixture = make_fixture();
        fixture.write("a.txt", b"a");

        for param in ["upload", "append", "delete", "rename", "mkdir"] {
            let result = fixture
                .post(Some("a.txt"), query(param, Some("nope")), AxumBody::from("x"))
                .await;
            assert!(
                matches!(result, Err(ApiError::Forbidden(_))),
                "{param} accepted a wrong password"
            );
            let result = fixture
                .post(Some("a.txt"), query(param, None), AxumBody::from("x"))
                .await;
            assert!(matches!(result, Err(ApiError::Forbidden(_))));
        }
        assert!(fixture.store.exists(&fixture.resolver.resolve("a.txt")).await);
    }

    #[tokio::test]
    async fn delete_moves_file_to_trash() {
        let fixture = make_fixture();
        fixture.write("docs/old.txt", b"bye");

        let response = fixture
            .post(Some("docs/old.txt"), query("delete", Some("secret")), AxumBody::empty())
            .await
            .expect("delete");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!fixture.store.exists(&fixture.resolver.resolve("docs/old.txt")).await);
        let trashed = std::fs::read_dir(fixture.store.trash_path())
            .expect("trash")
            .count();
        assert_eq!(trashed, 1);

        let missing = fixture
            .post(Some("docs/old.txt"), query("delete", Some("secret")), AxumBody::empty())
            .await;
        assert!(matches!(missing, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn mkdir_creates_nested_and_conflicts_on_existing() {
        let fixture = make_fixture();

        let response = fixture
            .post(Some("a/b/c"), query("mkdir", Some("secret")), AxumBody::empty())
            .await
            .expect("mkdir");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(fixture.store.is_dir(&fixture.resolver.resolve("a/b/c")).await);

        let again = fixture
            .post(Some("a/b/c"), query("mkdir", Some("secret")), AxumBody::empty())
            .await;
        assert!(matches!(again, Err(ApiError::Conflict(_))));
    }

    #[tokio::test]
    async fn ergodic_lists_without_password() {
        let fixture = make_fixture();
        fixture.write("share/b.txt", b"b");
        fixture.write("share/sub/inner.txt", b"i");

        let response = fixture
            .post(Some("share"), query("ergodic", None), AxumBody::empty())
            .await
            .expect("list");
        assert_eq!(body_text(response).await, "sub/\nb.txt\n");

        let mut json_query = query("ergodic", None);
        json_query.format = Some("json".into());
        let response = fixture
            .post(Some("share"), json_query, AxumBody::empty())
            .await
            .expect("list json");
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        let entries: serde_json::Value =
            serde_json::from_str(&body_text(response).await).expect("json");
        assert_eq!(entries[0]["name"], "sub");
        assert_eq!(entries[0]["is_dir"], true);
        assert_eq!(entries[1]["path"], "share/b.txt");
    }

    #[tokio::test]
    async fn ergodic_on_file_is_not_found() {
        let fixture = make_fixture();
        fixture.write("plain.txt", b"p");
        let result = fixture
            .post(Some("plain.txt"), query("ergodic", None), AxumBody::empty())
            .await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn unknown_param_serves_the_file() {
        let fixture = make_fixture();
        fixture.write("hello.txt", b"hello");

        let response = fixture
            .post(Some("hello.txt"), query("whatever", None), AxumBody::empty())
            .await
            .expect("serve");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "hello");
    }

    #[tokio::test]
    async fn upload_param_stores_raw_body_at_root() {
        let fixture = make_fixture();

        let response = fixture
            .post(None, query("upload", Some("secret")), AxumBody::from("payload"))
            .await
            .expect("upload");
        assert_eq!(response.status(), StatusCode::OK);
        let entries = fixture
            .store
            .list_dir(&fixture.resolver.resolve("/"))
            .await
            .expect("list");
        assert_eq!(entries.len(), 1);
        assert!(entries[0].name.starts_with("upload_"));
    }

    #[tokio::test]
    async fn reset_guard_checks_password() {
        let fixture = make_fixture();
        let guard = Arc::new(RateGuard::new(0, 0));
        guard.check("1.2.3.4").await;
        assert!(guard.is_under_attack());

        let denied = reset_guard(
            Query(query("", Some("nope"))),
            Extension(fixture.admin.clone()),
            Extension(guard.clone()),
        )
        .await;
        assert!(matches!(denied, Err(ApiError::Forbidden(_))));
        assert!(guard.is_under_attack());

        let response = reset_guard(
            Query(query("", Some("secret"))),
            Extension(fixture.admin.clone()),
            Extension(guard.clone()),
        )
        .await
        .expect("reset");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!guard.is_under_attack());
    }

    #[tokio::test]
    async fn append_extends_existing_file_and_respects_limit() {
        let fixture = make_fixture();
        fixture.write("logs/today.txt", b"one\n");

        let response = fixture
            .post(
                Some("logs/today.txt"),
                query("append", Some("secret")),
                AxumBody::from("two\n"),
            )
            .await
            .expect("append");
        assert_eq!(response.status(), StatusCode::OK);
        let target = fixture.resolver.resolve("logs/today.txt");
        assert_eq!(fixture.store.read(&target).await.expect("read"), b"one\ntwo\n");

        let empty = fixture
            .post(Some("logs/today.txt"), query("append", Some("secret")), AxumBody::empty())
            .await;
        assert!(matches!(empty, Err(ApiError::BadRequest(_))));

        let limited = Fixture {
            admin: Arc::new(AdminConfig {
                password: "secret".into(),
                max_upload_size: 4,
            }),
            ..fixture
        };
        let oversized = limited
            .post(
                Some("logs/today.txt"),
                query("append", Some("secret")),
                AxumBody::from("too long"),
            )
            .await;
        assert!(matches!(oversized, Err(ApiError::PayloadTooLarge)));
        assert_eq!(limited.store.read(&target).await.expect("read"), b"one\ntwo\n");
    }

    #[tokio::test]
    async fn rename_moves_entry_inside_root() {
        let fixture = make_fixture();
        fixture.write("inbox/a.txt", b"moved");
        fixture.write("taken.txt", b"t");

        let mut move_query = query("rename", Some("secret"));
        let missing_to = fixture
            .post(Some("inbox/a.txt"), move_query, AxumBody::empty())
            .await;
        assert!(matches!(missing_to, Err(ApiError::BadRequest(_))));

        move_query = query("rename", Some("secret"));
        move_query.to = Some("taken.txt".into());
        let conflict = fixture
            .post(Some("inbox/a.txt"), move_query, AxumBody::empty())
            .await;
        assert!(matches!(conflict, Err(ApiError::Conflict(_))));

        move_query = query("rename", Some("secret"));
        move_query.to = Some("../../archive/a.txt".into());
        let response = fixture
            .post(Some("inbox/a.txt"), move_query, AxumBody::empty())
            .await
            .expect("rename");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!fixture.store.exists(&fixture.resolver.resolve("inbox/a.txt")).await);
        let moved = fixture.resolver.resolve("archive/a.txt");
        assert_eq!(fixture.store.read(&moved).await.expect("read"), b"moved");

        move_query = query("rename", Some("secret"));
        move_query.to = Some("elsewhere.txt".into());
        let gone = fixture
            .post(Some("inbox/a.txt"), move_query, AxumBody::empty())
            .await;
        assert!(matches!(gone, Err(ApiError::NotFound(_))));
    }
}
