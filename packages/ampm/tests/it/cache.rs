use color_eyre::Result;
use pretty_assertions::assert_eq;

use ampm::{
    artifact::Record,
    error::{Fault, classify},
    remote::RemoteRepo,
    resolve::Target,
};

use crate::{Fixture, upload_file};

#[test_log::test(tokio::test)]
async fn target_link_text_is_the_returned_path() -> Result<()> {
    let fixture = Fixture::new();
    let (id, _) = upload_file(&fixture, "foobar", "hello.txt", b"hello", &[], &[]).await?;

    let resolver = fixture.resolver();
    let target = Target::parse(&id.to_string(), Vec::new())?;
    let path = resolver.get(&target).await?;

    let link = fixture
        .cache_dir
        .path()
        .join("metadata")
        .join(id.artifact_type.as_str())
        .join(format!("{}.target", id.fingerprint));
    let text = tokio::fs::read_link(&link).await?;
    assert_eq!(text, path);

    // The cached record copy agrees with the identifier's fingerprint.
    let toml = link.with_extension("toml");
    let bytes = ampm::fs::must_read_buffered(&toml).await?;
    let record = Record::parse(&bytes)?;
    assert_eq!(record.fingerprint()?, id.fingerprint);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn concurrent_fetches_converge_on_one_payload() -> Result<()> {
    let fixture = Fixture::new();
    let payload = vec![7u8; 64 * 1024];
    let (id, _) = upload_file(&fixture, "foobar", "big.bin", &payload, &[], &[]).await?;

    let resolver = fixture.resolver();
    let spec = id.to_string();
    let tasks = (0..10)
        .map(|_| {
            let resolver = resolver.clone();
            let spec = spec.clone();
            tokio::spawn(async move {
                let target = Target::parse(&spec, Vec::new())?;
                resolver.get(&target).await
            })
        })
        .collect::<Vec<_>>();

    let mut paths = Vec::new();
    for task in tasks {
        paths.push(task.await.expect("join fetch task")?);
    }
    paths.dedup();
    assert_eq!(paths.len(), 1, "every fetch observes the same path");

    let content = ampm::fs::must_read_buffered(&paths[0]).await?;
    assert_eq!(content, payload);

    // Exactly one payload directory, and no staging leftovers.
    let artifacts = fixture.cache_dir.path().join("artifacts/foobar");
    let mut entries = tokio::fs::read_dir(&artifacts).await?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    assert_eq!(names, vec![id.fingerprint.to_string()]);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn failed_fetches_leave_no_trace() -> Result<()> {
    let fixture = Fixture::new();
    let (id, record) = upload_file(&fixture, "foobar", "hello.txt", b"hello", &[], &[]).await?;

    // Break the payload on the remote, keeping the record.
    tokio::fs::remove_file(fixture.repo_dir.path().join(&record.remote_path)).await?;

    let resolver = fixture.resolver();
    let target = Target::parse(&id.to_string(), Vec::new())?;
    assert!(resolver.get(&target).await.is_err());

    let type_dir = fixture.cache_dir.path().join("artifacts/foobar");
    if type_dir.exists() {
        let mut entries = tokio::fs::read_dir(&type_dir).await?;
        assert!(
            entries.next_entry().await?.is_none(),
            "no payload or staging directories survive a failed fetch"
        );
    }
    assert!(
        !fixture
            .cache_dir
            .path()
            .join("metadata/foobar")
            .join(format!("{}.target", id.fingerprint))
            .exists(),
        "no target link is published for a failed fetch"
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn failed_refetch_never_invalidates_an_entry() -> Result<()> {
    let fixture = Fixture::new();
    let (id, _) = upload_file(&fixture, "foobar", "hello.txt", b"hello", &[], &[]).await?;

    let resolver = fixture.resolver();
    let target = Target::parse(&id.to_string(), Vec::new())?;
    let path = resolver.get(&target).await?;

    // Nuke the remote entirely; the published entry keeps answering.
    std::fs::remove_dir_all(fixture.repo_dir.path())?;
    assert_eq!(resolver.get(&target).await?, path);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn offline_mode_serves_hits_and_refuses_misses() -> Result<()> {
    let fixture = Fixture::new();
    let (hit, _) = upload_file(&fixture, "foobar", "hit.txt", b"hit", &[], &[]).await?;
    let (miss, _) = upload_file(&fixture, "foobar", "miss.txt", b"miss", &[], &[]).await?;

    // Warm only one of the two.
    let online = fixture.resolver();
    let path = online.get(&Target::parse(&hit.to_string(), Vec::new())?).await?;

    let offline = fixture.offline_resolver();
    assert_eq!(
        offline.get(&Target::parse(&hit.to_string(), Vec::new())?).await?,
        path
    );

    let err = offline
        .get(&Target::parse(&miss.to_string(), Vec::new())?)
        .await
        .unwrap_err();
    match classify(&err) {
        Some(Fault::OfflineMiss(what)) => assert_eq!(what, &miss.to_string()),
        other => panic!("expected OfflineMiss, got {other:?}"),
    }
    Ok(())
}

#[test_log::test(tokio::test)]
async fn offline_queries_scan_the_cache_not_the_repository() -> Result<()> {
    let fixture = Fixture::new();
    let (cached, _) =
        upload_file(&fixture, "foobar", "a.txt", b"a", &[("arch", "x86_64")], &[]).await?;
    upload_file(&fixture, "foobar", "b.txt", b"b", &[("arch", "i386")], &[]).await?;

    // Warm the cache with only the x86_64 record.
    let online = fixture.resolver();
    online
        .get(&Target::parse(&cached.to_string(), Vec::new())?)
        .await?;

    // Online, the query would be ambiguous on arch; offline it sees only
    // the cached record and resolves.
    let offline = fixture.offline_resolver();
    let target = Target::parse("foobar", Vec::new())?;
    let path = offline.get(&target).await?;
    assert_eq!(path.file_name().unwrap(), "a.txt");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn payload_matches_the_remote_bytes() -> Result<()> {
    let fixture = Fixture::new();
    let content = (0..=255u8).cycle().take(10_000).collect::<Vec<_>>();
    let (id, record) = upload_file(&fixture, "foobar", "data.bin", &content, &[], &[]).await?;

    let resolver = fixture.resolver();
    let path = resolver
        .get(&Target::parse(&id.to_string(), Vec::new())?)
        .await?;
    let local = ampm::fs::must_read_buffered(&path).await?;
    assert_eq!(local, content);

    // Independent fetch through the gateway agrees.
    let remote = RemoteRepo::open(fixture.repo_dir.path()).await?;
    let scratch = tempfile::tempdir()?;
    let refetched = remote.fetch_payload(&record, scratch.path()).await?;
    let remote_bytes = ampm::fs::must_read_buffered(&refetched).await?;
    assert_eq!(remote_bytes, content);
    Ok(())
}
