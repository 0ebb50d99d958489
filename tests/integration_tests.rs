use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::{Container, Pod as KubePod, PodSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube_runtime::watcher::Event;
use tokio_util::sync::CancellationToken;
use vkubelet::config::Config;
use vkubelet::pod::PHASE_RUNNING;
use vkubelet::provider::registry::{ProviderInitConfig, Registry};
use vkubelet::provider::BuiltProvider;
use vkubelet::resource_manager::ResourceManager;
use vkubelet::webserver::{metrics_routes, pod_routes};
use vkubelet::{Provider, VirtualKubelet};

mod fakes;

use fakes::FakeCluster;

const NODE_NAME: &str = "vk-mock";

fn init(config_path: Option<std::path::PathBuf>) -> ProviderInitConfig {
    ProviderInitConfig {
        config_path,
        node_name: NODE_NAME.to_owned(),
        operating_system: "Linux".to_owned(),
        internal_ip: Some("10.1.2.3".parse().unwrap()),
        daemon_port: 10250,
        resource_manager: ResourceManager::detached(),
    }
}

fn mock(config_path: Option<std::path::PathBuf>) -> BuiltProvider {
    let mut registry = Registry::new();
    mock_provider::register(&mut registry);
    registry.build("mock", init(config_path)).unwrap()
}

fn pod(name: &str) -> KubePod {
    KubePod {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some("default".to_owned()),
            uid: Some(format!("{}-uid", name)),
            resource_version: Some("1".to_owned()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(NODE_NAME.to_owned()),
            containers: vec![Container {
                name: "web".to_owned(),
                image: Some("nginx:1".to_owned()),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: None,
    }
}

fn config() -> Config {
    let mut config = Config::default_config(NODE_NAME, "mock");
    config.startup_timeout = Duration::from_secs(5);
    config.shutdown_grace = Duration::from_secs(1);
    config.provider_timeout = Duration::from_secs(5);
    config
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}

#[test]
fn registry_lists_mock() {
    let mut registry = Registry::new();
    mock_provider::register(&mut registry);
    assert_eq!(registry.list(), vec!["mock"]);
    assert!(!registry.exists("fleet"));
}

#[test]
fn mock_config_file_is_rejected_when_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mock.json");
    std::fs::write(&path, r#"{"vk-mock": {"memory": "plenty"}}"#).unwrap();

    let mut registry = Registry::new();
    mock_provider::register(&mut registry);
    let err = registry.build("mock", init(Some(path))).unwrap_err();
    assert!(format!("{:#}", err).contains("memory"));
}

#[tokio::test]
async fn pods_run_and_go_away() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mock.json");
    std::fs::write(&path, r#"{"vk-mock": {"cpu": "4", "pods": "7"}}"#).unwrap();

    let cluster = Arc::new(FakeCluster::default());
    cluster.send(Event::Restarted(vec![]));
    let kubelet = VirtualKubelet::new(config(), mock(Some(path)), cluster.clone(), cluster.clone())
        .without_http();
    let token = CancellationToken::new();
    let handle = tokio::spawn(kubelet.run(token.clone()));

    cluster.send(Event::Applied(pod("nginx")));
    let c = cluster.clone();
    eventually(|| {
        c.statuses()
            .iter()
            .any(|p| p.name() == "nginx" && p.phase() == Some(PHASE_RUNNING))
    })
    .await;

    let node = cluster.node().expect("node was registered");
    let labels = node.metadata.labels.unwrap();
    assert_eq!(labels["node.kubernetes.io/instance-type"], "mock");
    assert_eq!(labels["kubernetes.io/os"], "linux");
    let status = node.status.unwrap();
    let capacity = status.capacity.unwrap();
    assert_eq!(capacity["cpu"], Quantity("4".to_owned()));
    assert_eq!(capacity["pods"], Quantity("7".to_owned()));
    assert_eq!(status.addresses.unwrap()[0].address, "10.1.2.3");

    let mut deleting = pod("nginx");
    deleting.metadata.resource_version = Some("2".to_owned());
    deleting.metadata.deletion_timestamp = Some(Time(Utc::now()));
    deleting.metadata.deletion_grace_period_seconds = Some(30);
    cluster.send(Event::Applied(deleting));
    let c = cluster.clone();
    eventually(|| c.deletes() == vec!["default/nginx".to_owned()]).await;

    token.cancel();
    handle.await.unwrap().unwrap();
    let ready = cluster
        .node()
        .and_then(|n| n.status)
        .and_then(|s| s.conditions)
        .and_then(|c| c.into_iter().find(|c| c.type_ == "Ready"))
        .map(|c| c.status);
    assert_eq!(ready.as_deref(), Some("False"));
}

#[tokio::test]
async fn http_surface_serves_the_mock() {
    let built = mock(None);
    built
        .provider
        .create_pod(&pod("nginx").into())
        .await
        .unwrap();

    let routes = pod_routes(built.capabilities.clone());
    let res = warp::test::request()
        .method("GET")
        .path("/containerLogs/default/nginx/web?tailLines=3")
        .reply(&routes)
        .await;
    assert_eq!(res.status(), 200);
    let body = String::from_utf8(res.body().to_vec()).unwrap();
    assert_eq!(body.lines().count(), 3);

    let res = warp::test::request()
        .method("POST")
        .path("/exec/default/nginx/web?command=echo&command=hello")
        .reply(&routes)
        .await;
    assert_eq!(res.status(), 200);
    assert_eq!(res.body().as_ref(), b"echo hello\n");

    let res = warp::test::request()
        .method("GET")
        .path("/containerLogs/default/ghost/web")
        .reply(&routes)
        .await;
    assert_eq!(res.status(), 404);

    let res = warp::test::request()
        .method("GET")
        .path("/stats/summary")
        .reply(&metrics_routes(built.capabilities.clone()))
        .await;
    assert_eq!(res.status(), 200);
    let summary: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
    assert_eq!(summary["node"]["nodeName"], NODE_NAME);
    assert_eq!(summary["pods"][0]["podRef"]["name"], "nginx");
}
