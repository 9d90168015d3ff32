use std::collections::BTreeSet;

use chrono::Utc;
use tracing::{info, warn};

use crate::cache::ImageCache;
use crate::error::AppError;
use crate::models::{DeleteReport, ImageReference};
use crate::registry::RegistryClient;

/// With `tag_only`, sibling tags that shared the digest are re-pushed from a local copy.
/// Best effort: concurrent deletes or garbage collection mid-run defeat it.
pub async fn delete_image<C>(
    client: &RegistryClient,
    cache: &C,
    image: &ImageReference,
    tag_only: bool,
) -> Result<DeleteReport, AppError>
where
    C: ImageCache + Sync + ?Sized,
{
    if !tag_only {
        let digest = client
            .manifest_digest(&image.repository, &image.tag)
            .await?;
        info!("Deleting {} ({})", image, digest);
        client.delete_manifest(&image.repository, &digest).await?;
        return Ok(DeleteReport {
            image: image.to_string(),
            digest,
            ..DeleteReport::default()
        });
    }

    let before = client.list_tags(&image.repository).await?;
    info!("{} has {} tag(s) before delete", image.repository, before.len());

    let mut local = LocalState::new(cache);
    let result = delete_preserving_tags(client, cache, image, &before, &mut local).await;
    local.restore().await;
    result
}

async fn delete_preserving_tags<C>(
    client: &RegistryClient,
    cache: &C,
    image: &ImageReference,
    before: &BTreeSet<String>,
    local: &mut LocalState<'_, C>,
) -> Result<DeleteReport, AppError>
where
    C: ImageCache + Sync + ?Sized,
{
    let target = image.to_string();

    let had_local = local.backup_if_present(image).await?;
    info!("Pulling {}", target);
    cache.pull(&target).await?;
    if !had_local {
        local.scratch.push(target.clone());
    }

    let digest = client
        .manifest_digest(&image.repository, &image.tag)
        .await?;
    info!("Deleting {} ({})", image, digest);
    client.delete_manifest(&image.repository, &digest).await?;

    let after = client.list_tags(&image.repository).await?;
    let lost_tags: BTreeSet<String> = before
        .difference(&after)
        .filter(|t| **t != image.tag)
        .cloned()
        .collect();

    let mut report = DeleteReport {
        image: target,
        digest,
        lost_tags,
        ..DeleteReport::default()
    };

    for tag in &report.lost_tags {
        let sibling = image.with_tag(tag);
        match recreate_tag(cache, image, &sibling, local).await {
            Ok(()) => report.recreated.push(tag.clone()),
            Err(e) => {
                warn!("Failed to recreate {}: {}", sibling, e);
                report.failure_code.get_or_insert(e.exit_code());
                report.failed.push(tag.clone());
            }
        }
    }

    Ok(report)
}

/// tag + push + rmi; the local tag is removed even when the push fails.
async fn recreate_tag<C>(
    cache: &C,
    source: &ImageReference,
    sibling: &ImageReference,
    local: &mut LocalState<'_, C>,
) -> Result<(), AppError>
where
    C: ImageCache + Sync + ?Sized,
{
    let name = sibling.to_string();
    local.backup_if_present(sibling).await?;

    info!("Recreating {}", name);
    cache.tag(&source.to_string(), &name).await?;
    let pushed = cache.push(&name).await;
    let removed = cache.remove(&name).await;
    pushed?;
    removed
}

/// Local tags saved aside before being overwritten, and scratch tags to drop.
struct LocalState<'a, C: ?Sized> {
    cache: &'a C,
    stamp: String,
    backups: Vec<(String, String)>,
    scratch: Vec<String>,
}

impl<'a, C> LocalState<'a, C>
where
    C: ImageCache + Sync + ?Sized,
{
    fn new(cache: &'a C) -> Self {
        Self {
            cache,
            stamp: Utc::now().format("%Y%m%d%H%M%S").to_string(),
            backups: Vec::new(),
            scratch: Vec::new(),
        }
    }

    fn backup_name(&self, image: &ImageReference) -> String {
        image
            .with_tag(&format!("{}-regrm-backup-{}", image.tag, self.stamp))
            .to_string()
    }

    async fn backup_if_present(&mut self, image: &ImageReference) -> Result<bool, AppError> {
        let original = image.to_string();
        if !self.cache.exists(&original).await? {
            return Ok(false);
        }
        let backup = self.backup_name(image);
        info!("Backing up local {} as {}", original, backup);
        self.cache.tag(&original, &backup).await?;
        self.backups.push((original, backup));
        Ok(true)
    }

    /// Runs on success and failure alike; problems are logged, not returned.
    async fn restore(self) {
        for image in &self.scratch {
            if let Err(e) = self.cache.remove(image).await {
                warn!("Failed to remove local {}: {}", image, e);
            }
        }
        for (original, backup) in self.backups.iter().rev() {
            if let Err(e) = self.cache.tag(backup, original).await {
                warn!("Failed to restore local {} from {}: {}", original, backup, e);
                continue;
            }
            if let Err(e) = self.cache.remove(backup).await {
                warn!("Failed to remove backup {}: {}", backup, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use async_trait::async_trait;
    use mockito::{Matcher, Mock, Server, ServerGuard};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    const DIGEST: &str = "sha256:d1d1d1";

    /// Records every call and keeps a fake set of local tags.
    #[derive(Default)]
    struct RecordingCache {
        local: Mutex<BTreeSet<String>>,
        calls: Mutex<Vec<String>>,
        pushed: Mutex<Vec<String>>,
        fail_push: Option<String>,
    }

    impl RecordingCache {
        fn with_local(images: &[&str]) -> Self {
            let cache = Self::default();
            cache
                .local
                .lock()
                .unwrap()
                .extend(images.iter().map(|s| s.to_string()));
            cache
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ImageCache for RecordingCache {
        async fn exists(&self, image: &str) -> Result<bool, AppError> {
            self.record(format!("exists {}", image));
            Ok(self.local.lock().unwrap().contains(image))
        }

        async fn pull(&self, image: &str) -> Result<(), AppError> {
            self.record(format!("pull {}", image));
            self.local.lock().unwrap().insert(image.to_string());
            Ok(())
        }

        async fn tag(&self, source: &str, target: &str) -> Result<(), AppError> {
            self.record(format!("tag {} {}", source, target));
            self.local.lock().unwrap().insert(target.to_string());
            Ok(())
        }

        async fn push(&self, image: &str) -> Result<(), AppError> {
            self.record(format!("push {}", image));
            if self.fail_push.as_deref() == Some(image) {
                return Err(AppError::CacheTool {
                    command: format!("docker push {}", image),
                    code: Some(125),
                    stderr: "denied".into(),
                });
            }
            self.pushed.lock().unwrap().push(image.to_string());
            Ok(())
        }

        async fn remove(&self, image: &str) -> Result<(), AppError> {
            self.record(format!("rmi {}", image));
            self.local.lock().unwrap().remove(image);
            Ok(())
        }
    }

    fn config() -> Config {
        Config {
            plain_http: true,
            ..Config::default()
        }
    }

    /// Mocks that must stay registered for the whole test.
    type Mocks = Vec<Mock>;

    /// Registers the 401 probe and returns the bearer-authenticated mock to finish.
    async fn authed_mock(
        server: &mut ServerGuard,
        mocks: &mut Mocks,
        method: &str,
        path: &str,
    ) -> Mock {
        let challenge = format!(
            r#"Bearer realm="{}/token",service="test-registry",scope="repository:app/foo:*""#,
            server.url()
        );
        let probe = server
            .mock(method, path)
            .match_header("authorization", Matcher::Missing)
            .with_status(401)
            .with_header("www-authenticate", &challenge)
            .create_async()
            .await;
        mocks.push(probe);
        server
            .mock(method, path)
            .match_header("authorization", "Bearer abc")
    }

    async fn token_mock(server: &mut ServerGuard, mocks: &mut Mocks) {
        let token = server
            .mock("GET", "/token")
            .match_query(Matcher::Any)
            .with_body(r#"{"token":"abc"}"#)
            .create_async()
            .await;
        mocks.push(token);
    }

    /// Returns the authenticated DELETE mock, expected exactly once.
    async fn digest_and_delete_mocks(server: &mut ServerGuard, mocks: &mut Mocks) -> Mock {
        let digest = authed_mock(server, mocks, "GET", "/v2/app/foo/manifests/v1")
            .await
            .with_header("docker-content-digest", DIGEST)
            .with_body("{}")
            .create_async()
            .await;
        mocks.push(digest);
        let path = format!("/v2/app/foo/manifests/{}", DIGEST);
        authed_mock(server, mocks, "DELETE", &path)
            .await
            .with_status(202)
            .expect(1)
            .create_async()
            .await
    }

    /// Serves `first` on the first authenticated listing and `rest` afterwards.
    async fn tag_list_mock(
        server: &mut ServerGuard,
        mocks: &mut Mocks,
        first: &'static str,
        rest: &'static str,
    ) {
        let hits = Arc::new(AtomicUsize::new(0));
        let listing = authed_mock(server, mocks, "GET", "/v2/app/foo/tags/list")
            .await
            .with_body_from_request(move |_| {
                if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                    first.as_bytes().to_vec()
                } else {
                    rest.as_bytes().to_vec()
                }
            })
            .create_async()
            .await;
        mocks.push(listing);
    }

    fn image(server: &ServerGuard) -> ImageReference {
        format!("{}/app/foo:v1", server.host_with_port())
            .parse()
            .unwrap()
    }

    #[tokio::test]
    async fn test_plain_delete_issues_one_delete_and_no_recreate() {
        let mut server = Server::new_async().await;
        let mut mocks = Mocks::new();
        token_mock(&mut server, &mut mocks).await;
        let delete = digest_and_delete_mocks(&mut server, &mut mocks).await;
        let listing = server
            .mock("GET", "/v2/app/foo/tags/list")
            .expect(0)
            .create_async()
            .await;

        let client = RegistryClient::new(&config(), &server.host_with_port()).unwrap();
        let cache = RecordingCache::default();
        let image = image(&server);

        let report = delete_image(&client, &cache, &image, false).await.unwrap();

        delete.assert_async().await;
        listing.assert_async().await;
        assert_eq!(report.digest, DIGEST);
        assert!(report.lost_tags.is_empty());
        assert!(report.recreated.is_empty());
        assert!(cache.calls().is_empty());
    }

    #[tokio::test]
    async fn test_tag_only_recreates_sibling_tag() {
        let mut server = Server::new_async().await;
        let mut mocks = Mocks::new();
        token_mock(&mut server, &mut mocks).await;
        tag_list_mock(
            &mut server,
            &mut mocks,
            r#"{"name":"app/foo","tags":["v1","latest"]}"#,
            r#"{"name":"app/foo","tags":null}"#,
        )
        .await;
        let delete = digest_and_delete_mocks(&mut server, &mut mocks).await;

        let client = RegistryClient::new(&config(), &server.host_with_port()).unwrap();
        let cache = RecordingCache::default();
        let image = image(&server);
        let target = image.to_string();
        let latest = image.with_tag("latest").to_string();

        let report = delete_image(&client, &cache, &image, true).await.unwrap();

        delete.assert_async().await;
        assert_eq!(report.lost_tags, BTreeSet::from(["latest".to_string()]));
        assert_eq!(report.recreated, vec!["latest".to_string()]);
        assert!(report.failed.is_empty());
        assert_eq!(
            cache.calls(),
            vec![
                format!("exists {}", target),
                format!("pull {}", target),
                format!("exists {}", latest),
                format!("tag {} {}", target, latest),
                format!("push {}", latest),
                format!("rmi {}", latest),
                format!("rmi {}", target),
            ]
        );

        // registry keeps nothing after the delete; only the re-push remains
        let final_tags: BTreeSet<String> = cache
            .pushed
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.rsplit_once(':').unwrap().1.to_string())
            .collect();
        assert_eq!(final_tags, BTreeSet::from(["latest".to_string()]));
        assert!(cache.local.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tag_only_restores_existing_local_tags() {
        let mut server = Server::new_async().await;
        let mut mocks = Mocks::new();
        token_mock(&mut server, &mut mocks).await;
        tag_list_mock(
            &mut server,
            &mut mocks,
            r#"{"name":"app/foo","tags":["v1","latest","other"]}"#,
            r#"{"name":"app/foo","tags":["other"]}"#,
        )
        .await;
        let _delete = digest_and_delete_mocks(&mut server, &mut mocks).await;

        let client = RegistryClient::new(&config(), &server.host_with_port()).unwrap();
        let image = image(&server);
        let target = image.to_string();
        let latest = image.with_tag("latest").to_string();
        let cache = RecordingCache::with_local(&[target.as_str(), latest.as_str()]);

        let report = delete_image(&client, &cache, &image, true).await.unwrap();

        assert_eq!(report.recreated, vec!["latest".to_string()]);
        let calls = cache.calls();
        let backup_of = |name: &str| {
            calls
                .iter()
                .find_map(|c| {
                    c.strip_prefix(&format!("tag {} ", name))
                        .filter(|b| b.contains("-regrm-backup-"))
                        .map(str::to_string)
                })
                .unwrap()
        };
        let target_backup = backup_of(&target);
        let latest_backup = backup_of(&latest);

        assert!(calls.contains(&format!("tag {} {}", target_backup, target)));
        assert!(calls.contains(&format!("rmi {}", target_backup)));
        assert!(calls.contains(&format!("tag {} {}", latest_backup, latest)));
        assert!(calls.contains(&format!("rmi {}", latest_backup)));
        // the pulled target is replaced by the restored one, not removed
        assert!(!calls.contains(&format!("rmi {}", target)));

        let local = cache.local.lock().unwrap().clone();
        assert_eq!(local, BTreeSet::from([target, latest]));
    }

    #[tokio::test]
    async fn test_tag_only_restores_backup_when_digest_fails() {
        let mut server = Server::new_async().await;
        let mut mocks = Mocks::new();
        token_mock(&mut server, &mut mocks).await;
        tag_list_mock(
            &mut server,
            &mut mocks,
            r#"{"name":"app/foo","tags":["v1"]}"#,
            r#"{"name":"app/foo","tags":[]}"#,
        )
        .await;
        let _digest = authed_mock(&mut server, &mut mocks, "GET", "/v2/app/foo/manifests/v1")
            .await
            .with_status(404)
            .with_body(r#"{"errors":[{"code":"MANIFEST_UNKNOWN"}]}"#)
            .create_async()
            .await;

        let client = RegistryClient::new(&config(), &server.host_with_port()).unwrap();
        let image = image(&server);
        let target = image.to_string();
        let cache = RecordingCache::with_local(&[target.as_str()]);

        let err = delete_image(&client, &cache, &image, true).await.unwrap_err();

        assert_eq!(err.exit_code(), 22);
        let calls = cache.calls();
        let last_two = &calls[calls.len() - 2..];
        assert!(last_two[0].starts_with("tag ") && last_two[0].ends_with(&format!(" {}", target)));
        assert!(last_two[1].starts_with("rmi ") && last_two[1].contains("-regrm-backup-"));
        assert!(cache.local.lock().unwrap().contains(&target));
    }

    #[tokio::test]
    async fn test_tag_only_partial_recovery_continues() {
        let mut server = Server::new_async().await;
        let mut mocks = Mocks::new();
        token_mock(&mut server, &mut mocks).await;
        tag_list_mock(
            &mut server,
            &mut mocks,
            r#"{"name":"app/foo","tags":["v1","a","b"]}"#,
            r#"{"name":"app/foo","tags":[]}"#,
        )
        .await;
        let _delete = digest_and_delete_mocks(&mut server, &mut mocks).await;

        let client = RegistryClient::new(&config(), &server.host_with_port()).unwrap();
        let image = image(&server);
        let cache = RecordingCache {
            fail_push: Some(image.with_tag("a").to_string()),
            ..RecordingCache::default()
        };

        let report = delete_image(&client, &cache, &image, true).await.unwrap();

        assert_eq!(report.failed, vec!["a".to_string()]);
        assert_eq!(report.recreated, vec!["b".to_string()]);
        assert_eq!(report.failure_code, Some(125));
        // the failed tag is still removed locally
        assert!(cache
            .calls()
            .contains(&format!("rmi {}", image.with_tag("a"))));
        assert!(report.recovery_error().is_some());
    }
}
