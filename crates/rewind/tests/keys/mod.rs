use std::io::Write;

use rewind::{
    keys::{
        ContentKey, HttpKeyCache, KeyCache, KeyId, KeyResolver, KeySource, ProbeDecryptor,
        ProbeValidator, TimelineProbe,
    },
    util::HttpClient,
    RewindConfig, RewindResult,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use url::Url;
use wiremock::{
    matchers::{body_partial_json, header, method, path},
    Mock, MockServer, ResponseTemplate,
};

use crate::{
    common::{self, MpdOptions, AUDIO_KID, VIDEO_KID},
    AssertWrapper,
};

const KEY: &str = "00112233445566778899aabbccddeeff";

fn cache(server: &MockServer) -> HttpKeyCache {
    HttpKeyCache::new(
        HttpClient::default(),
        Url::parse(&format!("{}/keys", server.uri())).unwrap(),
        Some("secret".to_string()),
        "oqee".to_string(),
    )
}

#[tokio::test]
async fn test_key_cache_lookup() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/keys"))
        .and(header("Api-Key", "secret"))
        .and(body_partial_json(json!({
            "service": "oqee",
            "kid": VIDEO_KID,
            "channel": "536",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "key": KEY })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/keys"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "key": null })))
        .mount(&server)
        .await;

    let cache = cache(&server);
    let key = cache
        .lookup("536", &common::kid(VIDEO_KID))
        .await
        .assert_success()
        .assert_success();
    assert_eq!(key.to_hex(), KEY);

    let missing = cache.lookup("536", &common::kid(AUDIO_KID)).await?;
    assert!(missing.is_none());
    Ok(())
}

#[tokio::test]
async fn test_key_cache_server_error() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/keys"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    cache(&server)
        .lookup("536", &common::kid(VIDEO_KID))
        .await
        .assert_error();
    Ok(())
}

/// Outputs the key itself, so that only the right candidate looks decrypted.
struct KeyEcho;

impl ProbeDecryptor for KeyEcho {
    fn decrypt(&self, _probe: &[u8], _kid: &KeyId, key: &ContentKey) -> RewindResult<Vec<u8>> {
        Ok(key.as_bytes().to_vec())
    }
}

struct Expect(Vec<u8>);

impl ProbeValidator for Expect {
    fn validate(&self, decrypted: &[u8]) -> bool {
        decrypted == self.0.as_slice()
    }
}

#[tokio::test]
async fn test_cache_failure_falls_back_to_candidates() -> anyhow::Result<()> {
    let server = common::provider(&MpdOptions::default()).await;
    Mock::given(method("POST"))
        .and(path("/keys"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let timeline = common::resolve(&server, 30, &common::selector("best", "best"))
        .await
        .assert_success();

    let mut candidates = tempfile::NamedTempFile::new()?;
    writeln!(candidates, "{}", "aa".repeat(16))?;
    writeln!(candidates, "{}", "bb".repeat(16))?;
    writeln!(candidates, "{KEY}")?;
    writeln!(candidates, "{}", "cc".repeat(16))?;

    let mut config = RewindConfig::default().keys;
    config.cache_url = Some(format!("{}/keys", server.uri()));
    config.candidates_file = Some(candidates.path().to_path_buf());
    config.brute_force_batch_size = 2;
    config.probe_workers = 2;

    let key: ContentKey = KEY.parse()?;
    let resolver = KeyResolver::from_config(HttpClient::default(), &config)?
        .with_decryptor(KeyEcho)
        .with_validator(Expect(key.as_bytes().to_vec()));
    let probe = TimelineProbe::new(HttpClient::default(), &timeline);

    let keys = resolver
        .resolve(&timeline, &[], &probe, &CancellationToken::new())
        .await
        .assert_success();
    assert_eq!(keys.len(), 2);
    for kid in [VIDEO_KID, AUDIO_KID] {
        let kid = common::kid(kid);
        assert_eq!(keys.get(&kid), Some(&key));
        assert_eq!(keys.source(&kid), Some(KeySource::BruteForce));
    }
    Ok(())
}
