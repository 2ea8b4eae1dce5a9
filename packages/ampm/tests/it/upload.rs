use color_eyre::Result;
use pretty_assertions::assert_eq;

use ampm::{
    artifact::{Compression, PathType},
    resolve::Target,
    upload::UploadRequest,
};

use crate::{Fixture, pairs, snapshot_tree, upload_file};

#[test_log::test(tokio::test)]
async fn uploading_twice_is_idempotent() -> Result<()> {
    let fixture = Fixture::new();
    let attrs = &[("arch", "x86_64")];
    let (first, _) = upload_file(&fixture, "foobar", "a.txt", b"same", attrs, &[]).await?;
    let (second, _) = upload_file(&fixture, "foobar", "a.txt", b"same", attrs, &[]).await?;
    assert_eq!(first, second, "identical uploads share a fingerprint");

    // Exactly one record exists under the type.
    let mut entries = tokio::fs::read_dir(fixture.repo_dir.path().join("metadata/foobar")).await?;
    let mut count = 0;
    while entries.next_entry().await?.is_some() {
        count += 1;
    }
    assert_eq!(count, 1);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn differing_attributes_mint_differing_fingerprints() -> Result<()> {
    let fixture = Fixture::new();
    let (a, _) = upload_file(&fixture, "foobar", "a.txt", b"same", &[("arch", "x86_64")], &[]).await?;
    let (b, _) = upload_file(&fixture, "foobar", "a.txt", b"same", &[("arch", "i386")], &[]).await?;
    assert_ne!(a.fingerprint, b.fingerprint);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn default_remote_path_embeds_type_fingerprint_and_name() -> Result<()> {
    let fixture = Fixture::new();
    let (id, record) = upload_file(&fixture, "tools/compiler", "cc.bin", b"cc", &[], &[]).await?;
    assert_eq!(
        record.remote_path,
        format!("artifacts/tools/compiler/{}/cc.bin.gz", id.fingerprint)
    );
    assert_eq!(record.compression, Compression::Gzip);
    assert_eq!(record.path_type, PathType::File);
    assert!(fixture.repo_dir.path().join(&record.remote_path).is_file());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn directory_payloads_round_trip_through_tar() -> Result<()> {
    let fixture = Fixture::new();
    let tree = fixture.work_dir.path().join("toolchain");
    ampm::fs::write(tree.join("bin/cc"), b"#!/bin/sh\nexec true\n").await?;
    ampm::fs::write(tree.join("lib/libc.a"), b"archive").await?;
    tokio::fs::symlink("bin/cc", tree.join("cc")).await?;

    let request = UploadRequest::builder()
        .source(tree.clone())
        .artifact_type("tools/compiler".parse()?)
        .build();
    let resolver = fixture.resolver();
    let (id, record) = resolver.upload(request).await?;
    assert_eq!(record.path_type, PathType::Dir);
    assert_eq!(record.compression, Compression::TarGzip);
    assert_eq!(record.name, "toolchain");

    let path = resolver
        .get(&Target::parse(&id.to_string(), Vec::new())?)
        .await?;
    assert!(path.is_dir());
    assert_eq!(path.file_name().unwrap(), "toolchain");

    let original = snapshot_tree(&tree).await?;
    let materialized = snapshot_tree(&path).await?;
    assert_eq!(original, materialized);

    let link = tokio::fs::read_link(path.join("cc")).await?;
    assert_eq!(link, std::path::PathBuf::from("bin/cc"));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn uncompressed_uploads_store_payloads_verbatim() -> Result<()> {
    let fixture = Fixture::new();
    let source = fixture.stage_file("raw.bin", b"raw bytes").await;

    let request = UploadRequest::builder()
        .source(source)
        .artifact_type("foobar".parse()?)
        .uncompressed(true)
        .build();
    let resolver = fixture.resolver();
    let (id, record) = resolver.upload(request).await?;
    assert_eq!(record.compression, Compression::None);

    // The payload on the share is the literal bytes.
    let stored = ampm::fs::must_read_buffered(fixture.repo_dir.path().join(&record.remote_path)).await?;
    assert_eq!(stored, b"raw bytes");

    let path = resolver
        .get(&Target::parse(&id.to_string(), Vec::new())?)
        .await?;
    let fetched = ampm::fs::must_read_buffered(&path).await?;
    assert_eq!(fetched, b"raw bytes");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn explicit_name_and_remote_path_are_honored() -> Result<()> {
    let fixture = Fixture::new();
    let source = fixture.stage_file("whatever.bin", b"payload").await;

    let request = UploadRequest::builder()
        .source(source)
        .artifact_type("foobar".parse()?)
        .name(String::from("renamed.bin"))
        .remote_path(String::from("artifacts/custom/location.bin.gz"))
        .attributes(pairs(&[("arch", "x86_64")]))
        .build();
    let resolver = fixture.resolver();
    let (id, record) = resolver.upload(request).await?;
    assert_eq!(record.name, "renamed.bin");
    assert_eq!(record.remote_path, "artifacts/custom/location.bin.gz");
    assert!(fixture.repo_dir.path().join("artifacts/custom/location.bin.gz").is_file());

    let path = resolver
        .get(&Target::parse(&id.to_string(), Vec::new())?)
        .await?;
    assert_eq!(path.file_name().unwrap(), "renamed.bin");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn invalid_inputs_are_rejected_before_publication() -> Result<()> {
    let fixture = Fixture::new();
    let source = fixture.stage_file("ok.bin", b"ok").await;
    let resolver = fixture.resolver();

    // Missing payload.
    let request = UploadRequest::builder()
        .source(fixture.work_dir.path().join("absent.bin"))
        .artifact_type("foobar".parse()?)
        .build();
    assert!(resolver.upload(request).await.is_err());

    // Bad env key.
    let request = UploadRequest::builder()
        .source(source)
        .artifact_type("foobar".parse()?)
        .env(pairs(&[("NOT-A-NAME", "x")]))
        .build();
    assert!(resolver.upload(request).await.is_err());

    // Nothing was published.
    assert!(!fixture.repo_dir.path().join("metadata").exists());
    Ok(())
}
