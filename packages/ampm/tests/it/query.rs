use color_eyre::Result;
use pretty_assertions::assert_eq;

use ampm::{
    error::{Fault, classify},
    query::Constraint,
    resolve::Target,
};

use crate::{Fixture, upload_file};

fn target(spec: &str, constraints: &[&str]) -> Target {
    let constraints = constraints
        .iter()
        .map(|c| Constraint::parse(c).expect("parse constraint"))
        .collect();
    Target::parse(spec, constraints).expect("parse target")
}

#[test_log::test(tokio::test)]
async fn date_selector_resolves_among_equals() -> Result<()> {
    let fixture = Fixture::new();
    upload_file(
        &fixture,
        "foobar",
        "old.txt",
        b"old",
        &[("arch", "x86_64"), ("pubdate", "2024-01-01T00:00:00Z")],
        &[],
    )
    .await?;
    upload_file(
        &fixture,
        "foobar",
        "new.txt",
        b"new",
        &[("arch", "x86_64"), ("pubdate", "2024-06-01T00:00:00Z")],
        &[],
    )
    .await?;

    let resolver = fixture.resolver();
    let path = resolver
        .get(&target("foobar", &["arch=x86_64", "pubdate=@date:latest"]))
        .await?;
    assert_eq!(path.file_name().unwrap(), "new.txt");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn differing_attributes_make_selection_ambiguous() -> Result<()> {
    let fixture = Fixture::new();
    upload_file(&fixture, "foobar", "a.txt", b"a", &[("arch", "x86_64")], &[]).await?;
    upload_file(&fixture, "foobar", "b.txt", b"b", &[("arch", "i386")], &[]).await?;

    let resolver = fixture.resolver();
    let err = resolver
        .get(&target("foobar", &["pubdate=@date:latest"]))
        .await
        .unwrap_err();
    match classify(&err) {
        Some(Fault::AmbiguousQuery(msg)) => assert!(msg.contains("arch"), "{msg}"),
        other => panic!("expected AmbiguousQuery, got {other:?}"),
    }
    Ok(())
}

#[test_log::test(tokio::test)]
async fn semver_range_selects_the_greatest_match() -> Result<()> {
    let fixture = Fixture::new();
    for version in ["0.9.0", "1.2.3", "2.0.0"] {
        upload_file(
            &fixture,
            "foobar",
            &format!("tool-{version}.bin"),
            version.as_bytes(),
            &[("version", version)],
            &[],
        )
        .await?;
    }

    let resolver = fixture.resolver();
    let path = resolver
        .get(&target("foobar", &["version=@semver:^1.0.0"]))
        .await?;
    assert_eq!(path.file_name().unwrap(), "tool-1.2.3.bin");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn queries_miss_when_nothing_matches() -> Result<()> {
    let fixture = Fixture::new();
    upload_file(&fixture, "foobar", "a.txt", b"a", &[("arch", "x86_64")], &[]).await?;

    let resolver = fixture.resolver();
    let err = resolver
        .get(&target("foobar", &["arch=riscv64"]))
        .await
        .unwrap_err();
    assert!(matches!(classify(&err), Some(Fault::NotFound(_))));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn type_prefixes_match_whole_segments_only() -> Result<()> {
    let fixture = Fixture::new();
    upload_file(&fixture, "tools/compiler", "cc.bin", b"cc", &[], &[]).await?;
    upload_file(&fixture, "toolsmith", "ts.bin", b"ts", &[], &[]).await?;

    let resolver = fixture.resolver();
    let listed = resolver
        .list(&ampm::query::Query::new(Some("tools".parse()?), Vec::new()))
        .await?;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].1.artifact_type.as_str(), "tools/compiler");

    // And the prefix also matches an exact type.
    let exact = resolver
        .list(&ampm::query::Query::new(
            Some("tools/compiler".parse()?),
            Vec::new(),
        ))
        .await?;
    assert_eq!(exact.len(), 1);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn get_succeeds_exactly_when_list_reduces_to_one() -> Result<()> {
    let fixture = Fixture::new();
    upload_file(&fixture, "foobar", "a.txt", b"a", &[("version", "0.9.0")], &[]).await?;
    upload_file(&fixture, "foobar", "b.txt", b"b", &[("version", "1.2.3")], &[]).await?;

    let resolver = fixture.resolver();

    // One survivor after filtering: get agrees with list.
    let listed = resolver
        .list(&ampm::query::Query::new(
            Some("foobar".parse()?),
            vec![Constraint::parse("version=@semver:^1.0.0")?],
        ))
        .await?;
    assert_eq!(listed.len(), 1);
    let path = resolver
        .get(&target("foobar", &["version=@semver:^1.0.0"]))
        .await?;
    assert_eq!(path.file_name().unwrap(), "b.txt");

    // Two survivors and no applicable selector: get refuses.
    let listed = resolver
        .list(&ampm::query::Query::new(
            Some("foobar".parse()?),
            vec![Constraint::parse("version=@ignore")?],
        ))
        .await?;
    assert_eq!(listed.len(), 2);
    assert!(
        resolver
            .get(&target("foobar", &["version=@ignore"]))
            .await
            .is_err()
    );
    Ok(())
}
