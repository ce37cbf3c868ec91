//! Full deployment of a repository on disk against a fake workspace.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use wsdeploy_client::fakes::{FakeCredential, FnTransport};
use wsdeploy_client::{HttpRequest, Method, RawResponse, TransportError};
use wsdeploy_core::{DeployConfig, Deployer, NoopReporter};

fn write_item(root: &Path, dir: &str, item_type: &str, name: &str, logical_id: &str, files: &[(&str, &str)]) {
    let item_dir = root.join(dir);
    fs::create_dir_all(&item_dir).unwrap();
    fs::write(
        item_dir.join(".platform"),
        json!({
            "metadata": { "type": item_type, "displayName": name },
            "config": { "logicalId": logical_id }
        })
        .to_string(),
    )
    .unwrap();
    for (path, contents) in files {
        let target = item_dir.join(path);
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::write(target, contents).unwrap();
    }
}

fn workspace(request: &HttpRequest) -> Result<RawResponse, TransportError> {
    let url = request.url.as_str();
    if request.method == Method::GET && url.ends_with("/items") {
        return Ok(RawResponse::json(
            200,
            &json!({ "value": [
                { "id": "nb-1", "type": "Notebook", "displayName": "etl", "description": "" },
                { "id": "nb-old", "type": "Notebook", "displayName": "stale", "description": "" },
                { "id": "lh-old", "type": "Lakehouse", "displayName": "old_lake", "description": "" },
                { "id": "x-1", "type": "Dashboard", "displayName": "legacy", "description": "" }
            ]}),
        ));
    }
    if request.method == Method::POST && url.ends_with("/items") {
        let name = request
            .body
            .as_ref()
            .and_then(|body| body["displayName"].as_str())
            .unwrap_or_default();
        return Ok(RawResponse::json(201, &json!({ "id": format!("new-{name}") })));
    }
    Ok(RawResponse::new(200))
}

fn config(repository: &Path, extra: &str) -> DeployConfig {
    let raw = format!(
        r#"
        [workspace]
        id = {{ dev = "ws-dev" }}
        api_root = "https://api.test"
        repository_directory = "{}"

        [retry]
        default_retry_after_ms = 0
        base_delay_ms = 0
        max_delay_ms = 0
        poll_interval_ms = 0
        {extra}
        "#,
        repository.display().to_string().replace('\\', "/")
    );
    DeployConfig::from_toml_str(&raw).unwrap()
}

fn seed_repository(root: &Path) {
    write_item(root, "raw.Lakehouse", "Lakehouse", "raw", "lid-raw", &[]);
    write_item(
        root,
        "etl.Notebook",
        "Notebook",
        "etl",
        "lid-etl",
        &[("notebook-content.py", "print('etl')")],
    );
    write_item(
        root,
        "child.DataPipeline",
        "DataPipeline",
        "child",
        "lid-child",
        &[("pipeline-content.json", "{}")],
    );
    write_item(
        root,
        "parent.DataPipeline",
        "DataPipeline",
        "parent",
        "lid-parent",
        &[("pipeline-content.json", r#"{"invoke": "lid-child"}"#)],
    );
}

fn index_of(calls: &[HttpRequest], predicate: impl Fn(&HttpRequest) -> bool) -> usize {
    calls.iter().position(predicate).expect("request not sent")
}

#[tokio::test]
async fn deploy_publishes_in_order_and_removes_orphans() {
    let repo = tempfile::tempdir().unwrap();
    seed_repository(repo.path());
    let transport = Arc::new(FnTransport::new(workspace));

    let summary = Deployer::new(config(repo.path(), ""), Some("dev"))
        .with_transport(transport.clone())
        .with_reporter(Arc::new(NoopReporter))
        .deploy(Arc::new(FakeCredential::default()))
        .await
        .unwrap();

    assert!(summary.succeeded, "{summary:#?}");
    assert_eq!(summary.workspace_id, "ws-dev");
    let publish = summary.publish.as_ref().unwrap();
    assert_eq!(publish.outcomes.len(), 4);
    let unpublish = summary.unpublish.as_ref().unwrap();
    let removed: Vec<&str> = unpublish.outcomes.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(removed, vec!["stale"]);

    let calls = transport.calls();
    assert!(calls.iter().all(|c| c.url.starts_with("https://api.test/v1/workspaces/ws-dev/")));
    assert!(calls
        .iter()
        .all(|c| c.headers.get("Authorization").map(String::as_str) == Some("Bearer token-1")));

    let created = |name: &'static str| {
        move |c: &HttpRequest| {
            c.method == Method::POST
                && c.url.ends_with("/items")
                && c.body.as_ref().is_some_and(|b| b["displayName"] == name)
        }
    };
    // Storage before notebooks, notebooks before pipelines, referenced pipeline first.
    let lakehouse = index_of(&calls, created("raw"));
    let notebook = index_of(&calls, |c| c.url.contains("/items/nb-1/updateDefinition"));
    let child = index_of(&calls, created("child"));
    let parent = index_of(&calls, created("parent"));
    assert!(lakehouse < notebook && notebook < child && child < parent);

    // The existing notebook is updated in place, not recreated.
    assert!(!calls.iter().any(created("etl")));
    assert!(calls.iter().any(|c| c.method == Method::PATCH && c.url.ends_with("/items/nb-1")));

    // Gated and unknown types stay deployed.
    let deletes: Vec<&str> = calls
        .iter()
        .filter(|c| c.method == Method::DELETE)
        .map(|c| c.url.as_str())
        .collect();
    assert_eq!(deletes, vec!["https://api.test/v1/workspaces/ws-dev/items/nb-old"]);
}

#[tokio::test]
async fn skipped_passes_and_scope_are_honoured() {
    let repo = tempfile::tempdir().unwrap();
    seed_repository(repo.path());
    let transport = Arc::new(FnTransport::new(workspace));
    let mut config = config(
        repo.path(),
        r#"
        [unpublish]
        skip = { dev = true }
        "#,
    );
    config.workspace.item_types_in_scope = Some(vec!["Notebook".to_string()]);

    let summary = Deployer::new(config, Some("dev"))
        .with_transport(transport.clone())
        .with_reporter(Arc::new(NoopReporter))
        .deploy(Arc::new(FakeCredential::default()))
        .await
        .unwrap();

    assert!(summary.unpublish.is_none());
    let publish = summary.publish.unwrap();
    let names: Vec<&str> = publish.outcomes.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(names, vec!["etl"]);
    assert_eq!(transport.calls_matching("/items"), transport.calls().len());
    assert!(!transport.calls().iter().any(|c| c.method == Method::DELETE));
}

#[tokio::test]
async fn unknown_environment_fails_before_any_request() {
    let repo = tempfile::tempdir().unwrap();
    let transport = Arc::new(FnTransport::new(workspace));

    let err = Deployer::new(config(repo.path(), ""), Some("prod"))
        .with_transport(transport.clone())
        .deploy(Arc::new(FakeCredential::default()))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("prod"), "{err}");
    assert!(transport.calls().is_empty());
}
