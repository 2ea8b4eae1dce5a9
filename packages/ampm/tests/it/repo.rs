use color_eyre::Result;
use futures::TryStreamExt as _;
use pretty_assertions::assert_eq;

use ampm::{
    artifact::ArtifactId,
    error::{Fault, classify},
    remote::RemoteRepo,
    resolve::Target,
};

use crate::{Fixture, upload_file};

#[test_log::test(tokio::test)]
async fn get_by_exact_identifier_round_trips() -> Result<()> {
    let fixture = Fixture::new();
    let (id, _) = upload_file(&fixture, "foobar", "hello.txt", b"hello", &[], &[]).await?;

    let resolver = fixture.resolver();
    let target = Target::parse(&id.to_string(), Vec::new())?;
    let path = resolver.get(&target).await?;

    assert!(path.is_absolute());
    assert_eq!(path.file_name().unwrap(), "hello.txt");
    let content = ampm::fs::must_read_buffered(&path).await?;
    assert_eq!(content, b"hello");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn warm_cache_resolution_needs_no_repository() -> Result<()> {
    let fixture = Fixture::new();
    let (id, _) = upload_file(&fixture, "foobar", "hello.txt", b"hello", &[], &[]).await?;

    let resolver = fixture.resolver();
    let target = Target::parse(&id.to_string(), Vec::new())?;
    let first = resolver.get(&target).await?;

    // Remove the entire repository: the cached record and payload are
    // authoritative for exact identifiers.
    std::fs::remove_dir_all(fixture.repo_dir.path())?;
    let second = resolver.get(&target).await?;
    assert_eq!(first, second);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn env_renders_quoted_exports() -> Result<()> {
    let fixture = Fixture::new();
    let (id, _) = upload_file(
        &fixture,
        "foobar",
        "hello.txt",
        b"hello",
        &[],
        &[("APP_HOME", "/opt/app"), ("GREETING", "it's alive")],
    )
    .await?;

    let resolver = fixture.resolver();
    let target = Target::parse(&id.to_string(), Vec::new())?;
    let script = resolver.env(&target).await?;
    assert_eq!(
        script,
        "export APP_HOME='/opt/app'\nexport GREETING='it'\\''s alive'\n"
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn list_filters_without_reducing() -> Result<()> {
    let fixture = Fixture::new();
    upload_file(&fixture, "foobar", "a.txt", b"a", &[("arch", "x86_64")], &[]).await?;
    upload_file(&fixture, "foobar", "b.txt", b"b", &[("arch", "i386")], &[]).await?;
    upload_file(&fixture, "other", "c.txt", b"c", &[("arch", "x86_64")], &[]).await?;

    let resolver = fixture.resolver();
    let all = resolver
        .list(&ampm::query::Query::new(Some("foobar".parse()?), Vec::new()))
        .await?;
    assert_eq!(all.len(), 2);

    let constrained = resolver
        .list(&ampm::query::Query::new(
            Some("foobar".parse()?),
            vec![ampm::query::Constraint::parse("arch=x86_64")?],
        ))
        .await?;
    assert_eq!(constrained.len(), 1);
    assert_eq!(constrained[0].1.attributes["arch"], "x86_64");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn unparseable_records_are_skipped_not_fatal() -> Result<()> {
    let fixture = Fixture::new();
    let (id, _) = upload_file(&fixture, "foobar", "a.txt", b"a", &[], &[]).await?;

    // Drop garbage next to the real record.
    let garbage = fixture
        .repo_dir
        .path()
        .join("metadata/foobar/zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz.toml");
    ampm::fs::write(&garbage, b"this is not a record").await?;

    let remote = RemoteRepo::open(fixture.repo_dir.path()).await?;
    let listed = remote.list(None).try_collect::<Vec<_>>().await?;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].0, id);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn remove_is_hash_exact_and_total() -> Result<()> {
    let fixture = Fixture::new();
    let (id, record) = upload_file(&fixture, "foobar", "a.txt", b"a", &[], &[]).await?;

    let remote = RemoteRepo::open(fixture.repo_dir.path()).await?;

    // Removing a different fingerprint is NotFound.
    let missing = ArtifactId::new(
        id.artifact_type.clone(),
        "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".parse()?,
    );
    let err = remote.remove(&missing).await.unwrap_err();
    assert!(matches!(classify(&err), Some(Fault::NotFound(_))));

    remote.remove(&id).await?;
    assert!(!fixture.repo_dir.path().join("metadata/foobar").join(format!("{}.toml", id.fingerprint)).exists());
    assert!(!fixture.repo_dir.path().join(&record.remote_path).exists());

    // A fresh cache can no longer resolve it.
    let other = Fixture::new();
    let resolver = ampm::resolve::Resolver::new(ampm::config::Config {
        cache_dir: other.cache_dir.path().to_path_buf(),
        ..fixture.config()
    })?;
    let target = Target::parse(&id.to_string(), Vec::new())?;
    let err = resolver.get(&target).await.unwrap_err();
    assert!(matches!(classify(&err), Some(Fault::NotFound(_))));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn missing_repository_root_is_an_io_fault() -> Result<()> {
    let err = RemoteRepo::open("/definitely/not/mounted/anywhere")
        .await
        .unwrap_err();
    match classify(&err) {
        Some(Fault::IoError(msg)) => assert!(msg.contains("mounted"), "{msg}"),
        other => panic!("expected IoError, got {other:?}"),
    }
    Ok(())
}
