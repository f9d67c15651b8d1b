//! Acquisition pipeline
//!
//! Authenticated client and activation key in, catalog out: every new
//! catalog item gets a directory and an info file, each of its download URLs
//! becomes a [`Transfer`] on a shared [`TransferScheduler`], and every
//! completed encrypted file is handed to the [`DecodeStage`].
//!
//! Per-item failures are collected in the run's [`RunContext`] and reported
//! once all independent work has finished.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::app::activation::{request_activation_key, ActivationKey};
use crate::app::auth::AuthSession;
use crate::app::catalog::Catalog;
use crate::app::client::PortalClient;
use crate::app::decode::DecodeStage;
use crate::app::models::CatalogItem;
use crate::app::progress::{ProgressComposite, ProgressLeaf};
use crate::app::transfer::{FilterFn, ProgressFn, Transfer, TransferHandle, TransferScheduler};
use crate::constants::{decoder, transfers};
use crate::errors::Result;

/// Settings for one pipeline run
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Library root; books land in `<output_dir>/<authors>/<title>`
    pub output_dir: PathBuf,
    pub pool_size: usize,
    pub max_retries: u32,
    /// Abort transfers whose output name marks one part of a multi-part title
    pub skip_multipart: bool,
    pub decoder_program: String,
    pub encrypted_ext: String,
    pub decoded_ext: String,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            pool_size: transfers::DEFAULT_POOL_SIZE,
            max_retries: transfers::MAX_RETRIES,
            skip_multipart: true,
            decoder_program: decoder::DEFAULT_PROGRAM.to_string(),
            encrypted_ext: decoder::ENCRYPTED_EXTENSION.to_string(),
            decoded_ext: decoder::DECODED_EXTENSION.to_string(),
        }
    }
}

impl PipelineOptions {
    /// Indices of items that still need downloading
    ///
    /// Items whose directory already holds a decoded file are skipped; their
    /// info file is refreshed.
    pub fn pending_items(&self, items: &[CatalogItem]) -> Vec<usize> {
        let root = &self.output_dir;
        items
            .iter()
            .enumerate()
            .filter_map(|(index, item)| {
                match item.is_downloaded(root, &self.decoded_ext) {
                    Ok(true) => {
                        if let Err(e) = item.write_info_file(root) {
                            debug!("Could not refresh info for {:?}: {}", item.title, e);
                        }
                        None
                    }
                    Ok(false) => Some(index),
                    Err(e) => {
                        warn!("Could not inspect directory of {:?}: {}", item.title, e);
                        Some(index)
                    }
                }
            })
            .collect()
    }
}

/// Where in an item's processing a failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStage {
    Prepare,
    Transfer,
    Decode,
    Catalog,
}

impl fmt::Display for ItemStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ItemStage::Prepare => "preparing",
            ItemStage::Transfer => "downloading",
            ItemStage::Decode => "decrypting",
            ItemStage::Catalog => "saving catalog for",
        };
        f.write_str(name)
    }
}

/// A per-item failure that did not stop the run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemError {
    pub title: String,
    pub url: Option<String>,
    pub stage: ItemStage,
    pub message: String,
}

impl ItemError {
    fn new(title: &str, url: Option<&str>, stage: ItemStage, err: impl fmt::Display) -> Self {
        Self {
            title: title.to_string(),
            url: url.map(str::to_string),
            stage,
            message: err.to_string(),
        }
    }
}

impl fmt::Display for ItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error {} {:?}", self.stage, self.title)?;
        if let Some(url) = &self.url {
            write!(f, " ({})", url)?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Counters and collected errors of one run
#[derive(Debug, Default)]
pub struct RunContext {
    skipped_items: AtomicUsize,
    processed_items: AtomicUsize,
    downloaded: AtomicUsize,
    already_complete: AtomicUsize,
    aborted: AtomicUsize,
    decoded: AtomicUsize,
    errors: Mutex<Vec<ItemError>>,
}

impl RunContext {
    fn push(&self, error: ItemError) {
        warn!("{}", error);
        match self.errors.lock() {
            Ok(mut errors) => errors.push(error),
            Err(poisoned) => poisoned.into_inner().push(error),
        }
    }

    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::AcqRel);
    }

    fn report(&self, items_total: usize, cancelled: bool) -> RunReport {
        let errors = match self.errors.lock() {
            Ok(errors) => errors.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        RunReport {
            items_total,
            items_skipped: self.skipped_items.load(Ordering::Acquire),
            items_processed: self.processed_items.load(Ordering::Acquire),
            transfers_completed: self.downloaded.load(Ordering::Acquire),
            transfers_already_complete: self.already_complete.load(Ordering::Acquire),
            transfers_aborted: self.aborted.load(Ordering::Acquire),
            decoded: self.decoded.load(Ordering::Acquire),
            errors,
            cancelled,
        }
    }
}

/// Outcome of a pipeline run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub items_total: usize,
    /// Items whose directory already held a decoded file
    pub items_skipped: usize,
    pub items_processed: usize,
    pub transfers_completed: usize,
    pub transfers_already_complete: usize,
    /// Intentional skips, not failures
    pub transfers_aborted: usize,
    pub decoded: usize,
    pub errors: Vec<ItemError>,
    pub cancelled: bool,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && !self.cancelled
    }
}

fn multipart_filter() -> FilterFn {
    Arc::new(|path: &Path| {
        let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        !name.contains(transfers::MULTIPART_MARKER)
    })
}

fn leaf_callback(leaf: &Arc<ProgressLeaf>) -> ProgressFn {
    let leaf = Arc::clone(leaf);
    Arc::new(move |total: u64, done: u64| leaf.update(total, done))
}

/// What happens to one transfer after it finishes
struct FollowUp {
    title: String,
    url: String,
    decoder: DecodeStage,
    key: ActivationKey,
    encrypted_ext: String,
    download: Arc<ProgressLeaf>,
    decode: Arc<ProgressLeaf>,
    context: Arc<RunContext>,
}

impl FollowUp {
    fn is_encrypted(&self, path: &Path) -> bool {
        let wanted = self.encrypted_ext.trim_start_matches('.');
        path.extension().is_some_and(|ext| ext == wanted)
    }

    async fn finish(self, handle: TransferHandle) {
        let outcome = match handle.wait().await {
            Ok(outcome) => outcome,
            Err(e) if e.is_abort() => {
                info!("Skipping {}", e);
                RunContext::bump(&self.context.aborted);
                return;
            }
            Err(e) => {
                self.context.push(ItemError::new(
                    &self.title,
                    Some(self.url.as_str()),
                    ItemStage::Transfer,
                    e,
                ));
                return;
            }
        };

        self.download.complete();
        if outcome.already_complete {
            RunContext::bump(&self.context.already_complete);
            return;
        }
        RunContext::bump(&self.context.downloaded);

        if !self.is_encrypted(&outcome.path) {
            return;
        }

        let progress = leaf_callback(&self.decode);
        match self.decoder.decode(&outcome.path, &self.key, Some(progress)).await {
            Ok(_) => RunContext::bump(&self.context.decoded),
            Err(e) => self.context.push(ItemError::new(
                &self.title,
                Some(self.url.as_str()),
                ItemStage::Decode,
                e,
            )),
        }
    }
}

/// Downloads and decodes the new items of a catalog
pub struct AcquisitionPipeline {
    client: PortalClient,
    key: ActivationKey,
    options: PipelineOptions,
    decoder: DecodeStage,
    progress: Arc<ProgressComposite>,
}

impl fmt::Debug for AcquisitionPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquisitionPipeline")
            .field("base_url", &self.client.base_url().as_str())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl AcquisitionPipeline {
    /// Pipeline for an already authenticated client
    pub fn new(client: PortalClient, key: ActivationKey, options: PipelineOptions) -> Self {
        let decoder = DecodeStage::new(options.decoder_program.clone(), client.cancel_token().clone())
            .with_decoded_ext(options.decoded_ext.clone());
        Self {
            client,
            key,
            options,
            decoder,
            progress: ProgressComposite::new(),
        }
    }

    /// Authenticates, derives the activation key and builds the pipeline
    ///
    /// # Errors
    ///
    /// Authentication and activation failures are fatal for the run
    pub async fn prepare(session: AuthSession, player_id: &str, options: PipelineOptions) -> Result<Self> {
        let client = session.authenticate().await?;
        let key = request_activation_key(&client, player_id).await?;
        Ok(Self::new(client, key, options))
    }

    pub fn activation_key(&self) -> &ActivationKey {
        &self.key
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Library-wide progress: one composite per book, two leaves per download
    pub fn progress(&self) -> Arc<ProgressComposite> {
        Arc::clone(&self.progress)
    }

    /// Indices of items that still need downloading
    pub fn pending_items(&self, items: &[CatalogItem]) -> Vec<usize> {
        self.options.pending_items(items)
    }

    /// Processes every new item of `catalog` and records local paths
    pub async fn run(&self, catalog: &mut dyn Catalog) -> RunReport {
        let context = Arc::new(RunContext::default());
        let items = catalog.items().to_vec();
        let pending = self.pending_items(&items);
        context
            .skipped_items
            .store(items.len() - pending.len(), Ordering::Release);

        if pending.is_empty() {
            info!("All {} catalog items are already downloaded", items.len());
            return context.report(items.len(), self.client.is_cancelled());
        }
        info!("Downloading {} new items", pending.len());

        let scheduler = TransferScheduler::new(
            self.client.clone(),
            self.options.pool_size,
            self.options.max_retries,
        );
        scheduler.start().await;

        let mut followups = JoinSet::new();
        let mut processed = Vec::with_capacity(pending.len());

        for index in pending {
            let item = &items[index];
            let dir = item.dest_dir(&self.options.output_dir);
            if let Err(e) = std::fs::create_dir_all(&dir) {
                context.push(ItemError::new(&item.title, None, ItemStage::Prepare, e));
                continue;
            }
            if let Err(e) = item.write_info_file(&self.options.output_dir) {
                context.push(ItemError::new(&item.title, None, ItemStage::Prepare, e));
            }
            RunContext::bump(&context.processed_items);
            processed.push((index, dir.clone()));

            let book = self.progress.add_composite();
            for (label, url) in &item.downloads {
                debug!("Queueing {:?} of {:?}", label, item.title);
                let transfer = match Transfer::from_str_url(url) {
                    Ok(transfer) => transfer,
                    Err(e) => {
                        context.push(ItemError::new(&item.title, Some(url.as_str()), ItemStage::Transfer, e));
                        continue;
                    }
                };

                let download = book.add_leaf();
                let decode = book.add_leaf();
                let mut transfer = transfer
                    .dirname(&dir)
                    .detect_filename()
                    .final_ext(self.options.decoded_ext.clone())
                    .progress(leaf_callback(&download));
                if self.options.skip_multipart {
                    transfer = transfer.filter(multipart_filter());
                }

                let handle = match scheduler.add(transfer) {
                    Ok(handle) => handle,
                    Err(e) => {
                        context.push(ItemError::new(&item.title, Some(url.as_str()), ItemStage::Transfer, e));
                        continue;
                    }
                };

                let followup = FollowUp {
                    title: item.title.clone(),
                    url: url.clone(),
                    decoder: self.decoder.clone(),
                    key: self.key.clone(),
                    encrypted_ext: self.options.encrypted_ext.clone(),
                    download,
                    decode,
                    context: Arc::clone(&context),
                };
                followups.spawn(followup.finish(handle));
            }
        }

        let failures = scheduler.wait().await;
        debug!("Scheduler reported {} failed transfers", failures.len());

        while let Some(result) = followups.join_next().await {
            if let Err(e) = result {
                warn!("Item task panicked: {}", e);
            }
        }

        for (index, dir) in processed {
            catalog.set_local_path(index, dir);
        }
        if let Err(e) = catalog.persist() {
            context.push(ItemError::new("catalog", None, ItemStage::Catalog, e));
        }

        let report = context.report(items.len(), self.client.is_cancelled());
        info!(
            "Run finished: {} downloaded, {} decoded, {} skipped, {} errors",
            report.transfers_completed,
            report.decoded,
            report.transfers_aborted,
            report.errors.len()
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use mockito::{Matcher, Server, ServerGuard};
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;
    use url::Url;

    use crate::app::activation::extract_activation_key;
    use crate::app::client::{ClientConfig, PersistentCookieStore};
    use crate::app::progress::ProgressSource;

    fn key() -> ActivationKey {
        let mut data = b"(version=1)\n".to_vec();
        data.extend_from_slice(&[1, 2, 3, 4]);
        data.extend(std::iter::repeat(b'x').take(66));
        data.push(b'\n');
        extract_activation_key(&data).unwrap()
    }

    fn client_for(server: &ServerGuard) -> PortalClient {
        PortalClient::new(
            Url::parse(&server.url()).unwrap(),
            &ClientConfig::default(),
            Arc::new(PersistentCookieStore::in_memory()),
            CancellationToken::new(),
        )
        .unwrap()
    }

    fn options(root: &Path) -> PipelineOptions {
        PipelineOptions {
            output_dir: root.to_path_buf(),
            decoder_program: "definitely-not-a-decoder".into(),
            max_retries: 1,
            ..PipelineOptions::default()
        }
    }

    async fn serve_file(server: &mut ServerGuard, path: &str, name: &str, body: &str) {
        server
            .mock("HEAD", path)
            .with_header("content-disposition", &format!("attachment; filename=\"{}\"", name))
            .create_async()
            .await;
        server
            .mock("GET", path)
            .with_body(body)
            .create_async()
            .await;
    }

    #[test]
    fn test_multipart_filter() {
        let filter = multipart_filter();
        assert!(filter(Path::new("/lib/A/Title/Title.aax")));
        assert!(!filter(Path::new("/lib/A/Title/Title Part 2.aax")));
    }

    #[tokio::test]
    async fn test_already_downloaded_items_make_no_requests() {
        let mut server = Server::new_async().await;
        let nothing = server
            .mock("HEAD", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let root = tempdir().unwrap();
        let item = CatalogItem::new("Done")
            .with_author("A")
            .with_download("Download", format!("{}/done", server.url()));
        let dir = root.path().join(item.dir());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("Done.mp4"), b"decoded").unwrap();

        let pipeline = AcquisitionPipeline::new(client_for(&server), key(), options(root.path()));
        let mut catalog = vec![item];
        let report = pipeline.run(&mut catalog).await;

        assert_eq!(report.items_skipped, 1);
        assert_eq!(report.items_processed, 0);
        assert!(report.is_success());
        assert!(dir.join("info.txt").exists());
        nothing.assert_async().await;
    }

    #[tokio::test]
    async fn test_partial_success_collects_errors() {
        let mut server = Server::new_async().await;
        serve_file(&mut server, "/dl/one", "One.m4b", "first book").await;
        serve_file(&mut server, "/dl/two", "Two Part 1.m4b", "never fetched").await;
        server
            .mock("HEAD", "/dl/bad")
            .with_status(500)
            .create_async()
            .await;

        let root = tempdir().unwrap();
        let mut catalog = vec![
            CatalogItem::new("One")
                .with_author("A")
                .with_download("Download", format!("{}/dl/one", server.url())),
            CatalogItem::new("Two")
                .with_author("B")
                .with_download("Download", format!("{}/dl/two", server.url())),
            CatalogItem::new("Bad")
                .with_author("C")
                .with_download("Download", format!("{}/dl/bad", server.url())),
        ];

        let pipeline = AcquisitionPipeline::new(client_for(&server), key(), options(root.path()));
        let report = pipeline.run(&mut catalog).await;

        assert_eq!(report.items_processed, 3);
        assert_eq!(report.transfers_completed, 1);
        assert_eq!(report.transfers_aborted, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].title, "Bad");
        assert_eq!(report.errors[0].stage, ItemStage::Transfer);
        assert!(!report.is_success());

        let one = root.path().join("A/One/One.m4b");
        assert_eq!(std::fs::read_to_string(one).unwrap(), "first book");
        assert!(!root.path().join("B/Two/Two Part 1.m4b").exists());
        assert_eq!(catalog[0].local_path.as_deref(), Some(root.path().join("A/One").as_path()));
        assert_eq!(pipeline.progress().len(), 3);
        assert_eq!(pipeline.progress().percent(), 1.0);
    }

    #[tokio::test]
    async fn test_decode_failure_is_reported_per_item() {
        let mut server = Server::new_async().await;
        serve_file(&mut server, "/dl/enc", "Enc.aax", "encrypted").await;

        let root = tempdir().unwrap();
        let mut catalog = vec![CatalogItem::new("Enc")
            .with_author("A")
            .with_download("Download", format!("{}/dl/enc", server.url()))];

        let pipeline = AcquisitionPipeline::new(client_for(&server), key(), options(root.path()));
        let report = pipeline.run(&mut catalog).await;

        assert_eq!(report.transfers_completed, 1);
        assert_eq!(report.decoded, 0);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].stage, ItemStage::Decode);
        assert!(root.path().join("A/Enc/Enc.aax").exists());
    }

    /// Shell script that writes "decoded" to its last argument
    #[cfg(unix)]
    fn fake_decoder(bin: &Path) -> String {
        use std::os::unix::fs::PermissionsExt;

        let decoder = bin.join("fake-decoder");
        std::fs::write(
            &decoder,
            "#!/bin/sh\nfor arg in \"$@\"; do out=\"$arg\"; done\necho decoded > \"$out\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&decoder, std::fs::Permissions::from_mode(0o755)).unwrap();
        decoder.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_encrypted_download_is_decoded() {
        let mut server = Server::new_async().await;
        serve_file(&mut server, "/dl/enc", "Enc.aax", "encrypted").await;

        let bin = tempdir().unwrap();
        let root = tempdir().unwrap();
        let mut opts = options(root.path());
        opts.decoder_program = fake_decoder(bin.path());
        let mut catalog = vec![CatalogItem::new("Enc")
            .with_author("A")
            .with_download("Download", format!("{}/dl/enc", server.url()))];

        let pipeline = AcquisitionPipeline::new(client_for(&server), key(), opts);
        let report = pipeline.run(&mut catalog).await;

        assert!(report.is_success(), "{:?}", report.errors);
        assert_eq!(report.decoded, 1);
        assert!(!root.path().join("A/Enc/Enc.aax").exists());
        assert!(root.path().join("A/Enc/Enc.mp4").exists());
        assert_eq!(pipeline.progress().percent(), 1.0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_encrypted_file_left_by_earlier_run_is_decoded() {
        let mut server = Server::new_async().await;
        serve_file(&mut server, "/dl/enc", "Enc.aax", "encrypted").await;

        let bin = tempdir().unwrap();
        let root = tempdir().unwrap();
        let dir = root.path().join("A/Enc");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("Enc.aax"), "encrypted").unwrap();

        let mut opts = options(root.path());
        opts.decoder_program = fake_decoder(bin.path());
        let mut catalog = vec![CatalogItem::new("Enc")
            .with_author("A")
            .with_download("Download", format!("{}/dl/enc", server.url()))];

        let pipeline = AcquisitionPipeline::new(client_for(&server), key(), opts);
        let report = pipeline.run(&mut catalog).await;

        assert!(report.is_success(), "{:?}", report.errors);
        assert_eq!(report.transfers_already_complete, 0);
        assert_eq!(report.decoded, 1);
        assert!(!dir.join("Enc.aax").exists());
        assert_eq!(std::fs::read_to_string(dir.join("Enc.mp4")).unwrap(), "decoded\n");
    }

    #[tokio::test]
    async fn test_recorded_local_path_receives_download() {
        let mut server = Server::new_async().await;
        serve_file(&mut server, "/dl/one", "One.m4b", "first book").await;

        let root = tempdir().unwrap();
        let moved = tempdir().unwrap();
        let mut item = CatalogItem::new("One")
            .with_author("A")
            .with_download("Download", format!("{}/dl/one", server.url()));
        item.local_path = Some(moved.path().to_path_buf());
        let mut catalog = vec![item];

        let pipeline = AcquisitionPipeline::new(client_for(&server), key(), options(root.path()));
        let report = pipeline.run(&mut catalog).await;

        assert!(report.is_success(), "{:?}", report.errors);
        assert_eq!(std::fs::read_to_string(moved.path().join("One.m4b")).unwrap(), "first book");
        assert!(moved.path().join("info.txt").exists());
        assert!(!root.path().join("A/One").exists());
        assert_eq!(catalog[0].local_path.as_deref(), Some(moved.path()));
    }

    #[test]
    fn test_item_error_display() {
        let err = ItemError::new("Dune", Some("https://x/dl"), ItemStage::Decode, "exit 1");
        assert_eq!(err.to_string(), "Error decrypting \"Dune\" (https://x/dl): exit 1");
    }
}
