//! End-to-end tests for the acquisition pipeline
//!
//! A JSON catalog on disk is processed against a local HTTP server; the
//! decoder is a small shell script standing in for the real program.

use std::path::Path;
use std::sync::Arc;

use audible_fetcher::app::{
    AcquisitionPipeline, ActivationKey, Catalog, ClientConfig, JsonCatalog,
    PersistentCookieStore, PipelineOptions, PortalClient,
};
use mockito::{Server, ServerGuard};
use tempfile::TempDir;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;
use url::Url;

fn client_for(server: &ServerGuard, cancel: CancellationToken) -> PortalClient {
    PortalClient::new(
        Url::parse(&server.url()).unwrap(),
        &ClientConfig::default(),
        Arc::new(PersistentCookieStore::in_memory()),
        cancel,
    )
    .unwrap()
}

fn key() -> ActivationKey {
    "0a0b0c0d".parse().unwrap()
}

async fn serve_file(server: &mut ServerGuard, path: &str, name: &str, body: &str) {
    server
        .mock("HEAD", path)
        .with_header(
            "content-disposition",
            &format!("attachment; filename=\"{}\"", name),
        )
        .create_async()
        .await;
    server
        .mock("GET", path)
        .with_body(body)
        .create_async()
        .await;
}

fn write_catalog(dir: &Path, server: &ServerGuard) -> std::path::PathBuf {
    let path = dir.join("catalog.json");
    let json = format!(
        r#"[
  {{
    "title": "The Hobbit",
    "authors": ["J. R. R. Tolkien"],
    "narrators": ["Andy Serkis"],
    "detail_url": "{url}/pd/hobbit",
    "downloads": {{"Download": "{url}/dl/hobbit"}}
  }},
  {{
    "title": "Collected Stories",
    "authors": [],
    "downloads": {{
      "Part 1": "{url}/dl/stories-1",
      "Part 2": "{url}/dl/stories-2"
    }}
  }}
]"#,
        url = server.url()
    );
    std::fs::write(&path, json).unwrap();
    path
}

#[cfg(unix)]
fn fake_decoder(dir: &Path) -> String {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-decoder");
    std::fs::write(
        &path,
        "#!/bin/sh\nfor arg in \"$@\"; do out=\"$arg\"; done\necho decoded > \"$out\"\n",
    )
    .unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

#[cfg(unix)]
#[tokio::test]
async fn test_catalog_run_downloads_decodes_and_records_paths() {
    let mut server = Server::new_async().await;
    serve_file(&mut server, "/dl/hobbit", "The_Hobbit.aax", "encrypted hobbit").await;
    serve_file(&mut server, "/dl/stories-1", "Stories Part 1.aax", "one").await;
    serve_file(&mut server, "/dl/stories-2", "Stories Part 2.aax", "two").await;

    let work = TempDir::new().unwrap();
    let library = work.path().join("library");
    let catalog_path = write_catalog(work.path(), &server);

    let options = PipelineOptions {
        output_dir: library.clone(),
        pool_size: 2,
        decoder_program: fake_decoder(work.path()),
        ..PipelineOptions::default()
    };
    let pipeline = AcquisitionPipeline::new(
        client_for(&server, CancellationToken::new()),
        key(),
        options,
    );

    let mut catalog = assert_ok!(JsonCatalog::load(&catalog_path));
    let report = pipeline.run(&mut catalog).await;

    assert!(report.is_success(), "{:?}", report.errors);
    assert_eq!(report.items_total, 2);
    assert_eq!(report.items_processed, 2);
    assert_eq!(report.transfers_completed, 1);
    assert_eq!(report.transfers_aborted, 2);
    assert_eq!(report.decoded, 1);

    let hobbit = library.join("J. R. R. Tolkien/The Hobbit");
    assert!(hobbit.join("The_Hobbit.mp4").exists());
    assert!(!hobbit.join("The_Hobbit.aax").exists());
    let info = std::fs::read_to_string(hobbit.join("info.txt")).unwrap();
    assert!(info.starts_with("The Hobbit\nWritten by: J. R. R. Tolkien\nNarrated by: Andy Serkis"));

    let stories = library.join("Unknown Author/Collected Stories");
    assert!(stories.join("info.txt").exists());
    assert!(!stories.join("Stories Part 1.aax").exists());

    let saved = assert_ok!(JsonCatalog::load(&catalog_path));
    assert_eq!(saved.items()[0].local_path.as_deref(), Some(hobbit.as_path()));
}

#[cfg(unix)]
#[tokio::test]
async fn test_second_run_finds_nothing_new() {
    let mut server = Server::new_async().await;
    serve_file(&mut server, "/dl/hobbit", "The_Hobbit.aax", "encrypted hobbit").await;

    let work = TempDir::new().unwrap();
    let library = work.path().join("library");
    let catalog_path = work.path().join("catalog.json");
    std::fs::write(
        &catalog_path,
        format!(
            r#"[{{"title": "The Hobbit", "authors": ["J. R. R. Tolkien"], "downloads": {{"Download": "{}/dl/hobbit"}}}}]"#,
            server.url()
        ),
    )
    .unwrap();

    let options = PipelineOptions {
        output_dir: library.clone(),
        decoder_program: fake_decoder(work.path()),
        ..PipelineOptions::default()
    };

    let first = AcquisitionPipeline::new(
        client_for(&server, CancellationToken::new()),
        key(),
        options.clone(),
    );
    let mut catalog = assert_ok!(JsonCatalog::load(&catalog_path));
    assert_eq!(first.run(&mut catalog).await.decoded, 1);

    let catalog = assert_ok!(JsonCatalog::load(&catalog_path));
    assert!(options.pending_items(catalog.items()).is_empty());
}

#[tokio::test]
async fn test_cancelled_run_reports_interruption() {
    let mut server = Server::new_async().await;
    serve_file(&mut server, "/dl/hobbit", "The_Hobbit.aax", "encrypted hobbit").await;

    let work = TempDir::new().unwrap();
    let catalog_path = write_catalog(work.path(), &server);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let pipeline = AcquisitionPipeline::new(
        client_for(&server, cancel),
        key(),
        PipelineOptions {
            output_dir: work.path().join("library"),
            ..PipelineOptions::default()
        },
    );

    let mut catalog = assert_ok!(JsonCatalog::load(&catalog_path));
    let report = pipeline.run(&mut catalog).await;

    assert!(report.cancelled);
    assert_eq!(report.transfers_completed, 0);
    assert!(!work.path().join("library/J. R. R. Tolkien/The Hobbit/The_Hobbit.aax").exists());
}
