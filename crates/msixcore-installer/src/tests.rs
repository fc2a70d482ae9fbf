use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use crossbeam_channel::{Receiver, Sender};
use msixcore_core::{LogoSource, MANIFEST_FILE_NAME};
use parking_lot::Mutex;

use super::*;
use crate::staging::{collect_package_entries, copy_dir_recursive, unpack_with_runner, EntryKind};

const CONTOSO_PUBLISHER: &str = "CN=Contoso";
const NATIVE_HOST: HostVersion = HostVersion::new(10, 0, 17763);
const LEGACY_HOST: HostVersion = HostVersion::new(6, 3, 9600);

static TEST_LAYOUT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn build_test_layout_path(nanos: u128) -> PathBuf {
    let mut path = std::env::temp_dir();
    let sequence = TEST_LAYOUT_COUNTER.fetch_add(1, Ordering::Relaxed);
    path.push(format!(
        "msixcore-installer-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        sequence
    ));
    path
}

fn test_layout() -> InstallLayout {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    InstallLayout::new(build_test_layout_path(nanos))
}

fn manifest_xml(name: &str, version: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<Package xmlns="http://schemas.microsoft.com/appx/manifest/foundation/windows10"
         xmlns:rescap="http://schemas.microsoft.com/appx/manifest/foundation/windows10/restrictedcapabilities">
  <Identity Name="{name}" Version="{version}" ProcessorArchitecture="x64" Publisher="{CONTOSO_PUBLISHER}" />
  <Properties>
    <DisplayName>{name} Display</DisplayName>
    <PublisherDisplayName>Contoso</PublisherDisplayName>
    <Logo>Assets\logo.png</Logo>
  </Properties>
  <Capabilities><rescap:Capability Name="runFullTrust" /></Capabilities>
  <Applications>
    <Application Id="Main" Executable="VFS\ProgramFilesX64\{name}\{name}.exe" />
  </Applications>
</Package>"#
    )
}

fn full_name_of(name: &str, version: &str) -> String {
    format!("{name}_{version}_x64__h91ms92gdsmmt")
}

/// Writes an unpacked package: manifest, logo, an app binary under `VFS` and
/// the shared runtime every fixture carries.
fn write_package_fixture(root: &Path, name: &str, version: &str) -> PathBuf {
    let dir = root.join(format!("{name}-{version}"));
    fs::create_dir_all(dir.join("Assets")).expect("must create assets dir");
    fs::create_dir_all(dir.join("VFS").join("SystemX64")).expect("must create shared dir");
    fs::create_dir_all(dir.join("VFS").join("ProgramFilesX64").join(name))
        .expect("must create program dir");
    fs::write(dir.join(MANIFEST_FILE_NAME), manifest_xml(name, version)).expect("must write manifest");
    fs::write(dir.join("Assets").join("logo.png"), b"png").expect("must write logo");
    fs::write(dir.join("AppxBlockMap.xml"), "<BlockMap />").expect("must write block map");
    fs::write(dir.join("[Content_Types].xml"), "<Types />").expect("must write content types");
    fs::write(
        dir.join("VFS").join("SystemX64").join("shared.dll"),
        format!("shared runtime from {name}"),
    )
    .expect("must write shared dll");
    fs::write(
        dir.join("VFS")
            .join("ProgramFilesX64")
            .join(name)
            .join(format!("{name}.exe")),
        b"MZ",
    )
    .expect("must write app binary");
    dir
}

fn write_package_file(root: &Path) -> PathBuf {
    let path = root.join("fixture.msix");
    fs::write(&path, b"PK\x03\x04").expect("must write package file");
    path
}

fn self_hosted_manager(layout: &InstallLayout) -> PackageManager {
    PackageManager::with_layout(layout.clone())
        .expect("must create package manager")
        .with_host_version(LEGACY_HOST)
}

fn recording_callback() -> (ProgressCallback, Arc<Mutex<Vec<Response>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback: ProgressCallback = Box::new(move |response: &Response| {
        sink.lock().push(response.clone());
    });
    (callback, seen)
}

fn assert_progress_well_formed(responses: &[Response]) {
    let terminal_count = responses.iter().filter(|response| response.is_terminal()).count();
    assert_eq!(terminal_count, 1, "exactly one terminal response expected");
    assert!(
        responses.last().is_some_and(Response::is_terminal),
        "terminal response must be the last one"
    );
    for pair in responses.windows(2) {
        assert!(
            pair[1].percentage() >= pair[0].percentage(),
            "percentage must never decrease: {:?}",
            responses
        );
    }
}

/// Copies a prepared directory instead of reading the package file.
struct DirectoryUnpacker {
    content: PathBuf,
}

impl PackageUnpacker for DirectoryUnpacker {
    fn unpack(&self, _package_path: &Path, destination: &Path) -> anyhow::Result<()> {
        copy_dir_recursive(&self.content, destination)
    }
}

/// Signals when unpacking starts and waits to be released.
struct BlockingUnpacker {
    content: PathBuf,
    started: Sender<()>,
    release: Receiver<()>,
}

impl PackageUnpacker for BlockingUnpacker {
    fn unpack(&self, _package_path: &Path, destination: &Path) -> anyhow::Result<()> {
        let _ = self.started.send(());
        let _ = self.release.recv();
        copy_dir_recursive(&self.content, destination)
    }
}

#[derive(Default)]
struct RecordingNativeService {
    progress: Vec<u32>,
    failure: Option<u32>,
    payloads: Mutex<Vec<Vec<u8>>>,
    added: Mutex<Vec<PathBuf>>,
    removed: Mutex<Vec<String>>,
}

impl NativeDeploymentService for RecordingNativeService {
    fn add_package(
        &self,
        package_path: &Path,
        _options: DeploymentOptions,
        progress: &mut dyn FnMut(u32),
    ) -> Result<(), DeploymentError> {
        self.added.lock().push(package_path.to_path_buf());
        if let Ok(bytes) = fs::read(package_path) {
            self.payloads.lock().push(bytes);
        }
        for percentage in &self.progress {
            progress(*percentage);
        }
        match self.failure {
            Some(code) => Err(DeploymentError::NativeService {
                code,
                message: "package conflicts with an existing install".to_string(),
            }),
            None => Ok(()),
        }
    }

    fn remove_package(&self, full_name: &str) -> Result<(), DeploymentError> {
        self.removed.lock().push(full_name.to_string());
        Ok(())
    }
}

struct FailingReader;

impl Read for FailingReader {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::Other, "stream interrupted"))
    }
}

fn start_one_shot_http_server(payload: Vec<u8>) -> (String, std::thread::JoinHandle<()>) {
    let listener =
        std::net::TcpListener::bind("127.0.0.1:0").expect("must bind one-shot test server");
    let address = listener
        .local_addr()
        .expect("must read one-shot test server address");
    let url = format!("http://{address}/packages/app.msix");
    let handle = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("must accept test client");
        let mut request_buffer = [0_u8; 1024];
        let _ = std::io::Read::read(&mut stream, &mut request_buffer);
        std::io::Write::write_all(
            &mut stream,
            format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                payload.len()
            )
            .as_bytes(),
        )
        .expect("must write test response headers");
        std::io::Write::write_all(&mut stream, &payload).expect("must write test response payload");
        std::io::Write::flush(&mut stream).expect("must flush test response payload");
    });
    (url, handle)
}

#[test]
fn build_test_layout_path_disambiguates_same_timestamp_calls() {
    let first = build_test_layout_path(42);
    let second = build_test_layout_path(42);
    assert_ne!(first, second);
}

#[test]
fn strategy_follows_host_version_threshold() {
    assert_eq!(
        select_strategy(HostVersion::new(6, 3, 9600)),
        DeploymentStrategy::SelfHosted
    );
    assert_eq!(
        select_strategy(HostVersion::new(10, 0, 16298)),
        DeploymentStrategy::SelfHosted
    );
    assert_eq!(
        select_strategy(HostVersion::new(10, 0, 16299)),
        DeploymentStrategy::NativeService
    );
    assert_eq!(
        select_strategy(HostVersion::new(10, 0, 17000)),
        DeploymentStrategy::NativeService
    );
    assert_eq!(
        select_strategy(HostVersion::new(11, 0, 0)),
        DeploymentStrategy::NativeService
    );
}

#[test]
fn strategy_preference_overrides_host_detection() {
    assert_eq!(
        StrategyPreference::Auto.resolve(None),
        DeploymentStrategy::SelfHosted
    );
    assert_eq!(
        StrategyPreference::Auto.resolve(Some(NATIVE_HOST)),
        DeploymentStrategy::NativeService
    );
    assert_eq!(
        StrategyPreference::SelfHosted.resolve(Some(NATIVE_HOST)),
        DeploymentStrategy::SelfHosted
    );
    assert_eq!(
        StrategyPreference::NativeService.resolve(None),
        DeploymentStrategy::NativeService
    );
    assert_eq!(
        StrategyPreference::parse(" Native ").expect("must parse alias"),
        StrategyPreference::NativeService
    );
    assert!(StrategyPreference::parse("msi").is_err());
}

#[test]
fn host_version_parse_accepts_optional_revision() {
    assert_eq!(
        HostVersion::parse("10.0.19045").expect("must parse"),
        HostVersion::new(10, 0, 19045)
    );
    assert_eq!(
        HostVersion::parse("10.0.19045.3803").expect("must parse"),
        HostVersion::new(10, 0, 19045)
    );
    assert!(HostVersion::parse("10.0").is_err());
    assert!(HostVersion::parse("10.x.1").is_err());
    assert_eq!(HostVersion::new(10, 0, 16299).to_string(), "10.0.16299");
}

#[test]
fn config_parses_strategy_and_timeout() {
    let config = ManagerConfig::from_toml_str(
        r#"
prefix = "/opt/msixcore"
strategy = "self-hosted"
download_timeout_secs = 30
"#,
    )
    .expect("must parse config");
    assert_eq!(config.prefix, Some(PathBuf::from("/opt/msixcore")));
    assert_eq!(config.strategy, StrategyPreference::SelfHosted);
    assert_eq!(config.download_timeout(), Duration::from_secs(30));
}

#[test]
fn config_rejects_unknown_fields_and_zero_timeout() {
    assert!(ManagerConfig::from_toml_str("retries = 3").is_err());
    assert!(ManagerConfig::from_toml_str("download_timeout_secs = 0").is_err());
    let empty = ManagerConfig::from_toml_str("").expect("must accept empty config");
    assert_eq!(empty, ManagerConfig::default());
}

#[test]
fn config_load_treats_missing_file_as_default() {
    let layout = test_layout();
    let config = ManagerConfig::load(&layout.config_path()).expect("must load default");
    assert_eq!(config, ManagerConfig::default());

    fs::create_dir_all(layout.prefix()).expect("must create prefix");
    fs::write(layout.config_path(), "strategy = \"native-service\"\n").expect("must write config");
    let config = ManagerConfig::load(&layout.config_path()).expect("must load config");
    assert_eq!(config.strategy, StrategyPreference::NativeService);

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn layout_paths_stay_under_prefix() {
    let layout = InstallLayout::new("/tmp/msixcore-root");
    assert_eq!(
        layout.package_dir("App_1.0.0.0_x64__h91ms92gdsmmt"),
        PathBuf::from("/tmp/msixcore-root/packages/App_1.0.0.0_x64__h91ms92gdsmmt")
    );
    assert_eq!(layout.shared_dir(), PathBuf::from("/tmp/msixcore-root/shared"));

    let cached = layout.download_cache_path("https://example.test/dist/app.msix?sig=abc");
    assert!(cached.starts_with(layout.downloads_dir()));
    assert_eq!(
        cached.file_name().and_then(|name| name.to_str()),
        Some("app.msix")
    );
    assert_ne!(
        cached,
        layout.download_cache_path("https://mirror.test/dist/app.msix")
    );
}

#[test]
fn package_source_parse_detects_urls() {
    assert!(matches!(
        PackageSource::parse("https://example.test/app.msix"),
        PackageSource::Url(_)
    ));
    assert!(matches!(
        PackageSource::parse("HTTP://example.test/app.msix"),
        PackageSource::Url(_)
    ));
    assert!(matches!(
        PackageSource::parse("C:\\packages\\app.msix"),
        PackageSource::Path(_)
    ));
}

#[test]
fn reporter_keeps_percentage_monotonic_and_single_terminal() {
    let (callback, seen) = recording_callback();
    let mut reporter = ProgressReporter::new(Some(callback), None, CancellationToken::default());

    reporter.update(InstallationStep::Started, 0.0);
    reporter.update(InstallationStep::Extraction, 50.0);
    reporter.update(InstallationStep::Extraction, 30.0);
    assert_eq!(reporter.snapshot().percentage(), 50.0);

    reporter.update(InstallationStep::Completed, 100.0);
    assert_eq!(reporter.snapshot().status(), InstallationStep::Extraction);

    reporter.complete();
    reporter.update(InstallationStep::Extraction, 10.0);
    reporter.fail(&anyhow!("late failure"));

    let responses = seen.lock().clone();
    assert_progress_well_formed(&responses);
    let last = responses.last().expect("must have responses");
    assert!(last.is_success());
    assert_eq!(last.percentage(), 100.0);
    assert!(last.error().is_none());
}

#[test]
fn reporter_failure_keeps_last_percentage_and_code() {
    let mut reporter = ProgressReporter::detached();
    reporter.update(InstallationStep::Extraction, 40.0);
    let err = anyhow::Error::from(DeploymentError::NotFound("Missing".to_string()))
        .context("failed to remove package");
    reporter.fail(&err);

    let response = reporter.finish();
    assert_eq!(response.status(), InstallationStep::Error);
    assert_eq!(response.percentage(), 40.0);
    assert_eq!(response.error_code(), Some(ERROR_NOT_FOUND));
    assert!(response
        .error_text()
        .is_some_and(|text| text.contains("Missing")));
}

#[test]
fn error_code_walks_context_chain() {
    let err = anyhow::Error::from(DeploymentError::Cancelled).context("install aborted");
    assert_eq!(error_code(&err), ERROR_INSTALL_USEREXIT);
    assert_eq!(error_code(&anyhow!("plain failure")), msixcore_core::E_FAIL);
    let manifest = anyhow::Error::from(msixcore_core::ManifestError::MissingElement("Identity"));
    assert_eq!(error_code(&manifest), msixcore_core::APPX_E_INVALID_MANIFEST);
}

#[test]
fn in_flight_claim_is_released_on_drop() {
    let in_flight = Arc::new(InFlightPackages::default());
    let claim = in_flight
        .claim("App_1.0.0.0_x64__h91ms92gdsmmt")
        .expect("must claim package");
    let err = in_flight
        .claim("APP_1.0.0.0_X64__H91MS92GDSMMT")
        .expect_err("must reject second claim");
    assert_eq!(err.code(), ERROR_BUSY);

    drop(claim);
    assert!(!in_flight.is_claimed("App_1.0.0.0_x64__h91ms92gdsmmt"));
}

#[test]
fn collect_package_entries_orders_payload_footprint_manifest() {
    let layout = test_layout();
    let raw = layout.prefix().join("raw");
    fs::create_dir_all(raw.join("VFS").join("SystemX64")).expect("must create raw dirs");
    fs::write(raw.join("[Content_Types].xml"), "<Types />").expect("must write content types");
    fs::write(raw.join("AppxBlockMap.xml"), "<BlockMap />").expect("must write block map");
    fs::write(raw.join(MANIFEST_FILE_NAME), "<Package />").expect("must write manifest");
    fs::write(raw.join("VFS").join("SystemX64").join("a%20b.dll"), b"dll")
        .expect("must write payload");
    fs::write(raw.join("zeta.txt"), b"z").expect("must write payload");

    let entries = collect_package_entries(&raw).expect("must collect entries");
    let listed = entries
        .iter()
        .map(|entry| (entry.relative.clone(), entry.kind))
        .collect::<Vec<_>>();
    assert_eq!(
        listed,
        vec![
            (
                PathBuf::from("VFS").join("SystemX64").join("a b.dll"),
                EntryKind::Payload
            ),
            (PathBuf::from("zeta.txt"), EntryKind::Payload),
            (PathBuf::from("AppxBlockMap.xml"), EntryKind::Footprint),
            (PathBuf::from(MANIFEST_FILE_NAME), EntryKind::Manifest),
        ]
    );

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn collect_package_entries_rejects_traversal_after_decoding() {
    let layout = test_layout();
    let raw = layout.prefix().join("raw");
    fs::create_dir_all(raw.join("%2E%2E")).expect("must create encoded dir");
    fs::write(raw.join("%2E%2E").join("escape.txt"), b"x").expect("must write payload");

    let err = collect_package_entries(&raw).expect_err("must reject traversal");
    assert!(format!("{err:#}").contains("unsafe path component"));

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn unpack_with_runner_falls_back_to_next_tool() {
    let layout = test_layout();
    let package = write_package_file({
        fs::create_dir_all(layout.prefix()).expect("must create prefix");
        layout.prefix()
    });
    let destination = layout.prefix().join("raw");

    let mut attempted = Vec::new();
    unpack_with_runner(&package, &destination, |command, _context| {
        let program = command.get_program().to_string_lossy().into_owned();
        attempted.push(program.clone());
        if program == "tar" {
            Ok(())
        } else {
            Err(anyhow!("{program} is not installed"))
        }
    })
    .expect("must fall back to tar");
    assert_eq!(attempted.last().map(String::as_str), Some("tar"));
    assert!(attempted.iter().any(|program| program == "unzip"));
    assert!(destination.is_dir());

    let err = unpack_with_runner(&package, &destination, |command, _context| {
        Err(anyhow!(
            "{} is not installed",
            command.get_program().to_string_lossy()
        ))
    })
    .expect_err("must fail when every tool fails");
    let message = format!("{err:#}");
    assert!(message.contains("unzip is not installed"));
    assert!(message.contains("tar is not installed"));

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn download_package_writes_cache_without_part_file() {
    let layout = test_layout();
    let (url, server) = start_one_shot_http_server(b"package-bytes".to_vec());
    let cache_path = layout.download_cache_path(&url);

    download_package(&url, &cache_path, Duration::from_secs(10)).expect("must download package");
    server.join().expect("server thread must finish");

    assert_eq!(
        fs::read(&cache_path).expect("must read cached package"),
        b"package-bytes"
    );
    assert!(!cache_path.with_file_name("app.msix.part").exists());

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn materialize_stream_copies_bytes_and_cleans_up_on_drop() {
    let layout = test_layout();
    let mut stream = io::Cursor::new(b"streamed package".to_vec());
    let temp_path = materialize_stream(&mut stream, &layout.tmp_dir()).expect("must materialize");
    assert_eq!(
        fs::read(&temp_path).expect("must read materialized file"),
        b"streamed package"
    );

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(&temp_path)
            .expect("must stat materialized file")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o750);
    }

    let path = temp_path.to_path_buf();
    drop(temp_path);
    assert!(!path.exists());

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn install_from_directory_registers_package() {
    let layout = test_layout();
    let fixtures = layout.prefix().join("fixtures");
    let source = write_package_fixture(&fixtures, "App", "1.0.0.0");
    let manager = self_hosted_manager(&layout);
    assert_eq!(manager.strategy(), DeploymentStrategy::SelfHosted);

    manager
        .add_package(PackageSource::Path(source), DeploymentOptions::None)
        .expect("must install package");

    let full_name = full_name_of("App", "1.0.0.0");
    let installed = manager
        .find_package(&full_name)
        .expect("must query registry")
        .expect("must find installed package");
    assert_eq!(installed.install_location(), layout.package_dir(&full_name));
    assert_eq!(installed.package().display_name(), "App Display");
    assert_eq!(
        installed.resolved_executable(),
        Some(
            layout
                .shared_dir()
                .join("ProgramFilesX64")
                .join("App")
                .join("App.exe")
                .as_path()
        )
    );
    assert!(layout.package_dir(&full_name).join(MANIFEST_FILE_NAME).is_file());
    assert!(!layout
        .package_dir(&full_name)
        .join("[Content_Types].xml")
        .exists());
    assert!(layout
        .shared_dir()
        .join("SystemX64")
        .join("shared.dll")
        .is_file());

    let by_family = manager
        .find_package_by_family_name("App_h91ms92gdsmmt")
        .expect("must query by family")
        .expect("must find by family");
    assert_eq!(by_family.full_name().as_str(), full_name);

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn find_packages_matches_wildcards() {
    let layout = test_layout();
    let fixtures = layout.prefix().join("fixtures");
    let manager = self_hosted_manager(&layout);
    for name in ["AppOne", "AppTwo", "Tool"] {
        let source = write_package_fixture(&fixtures, name, "1.0.0.0");
        manager
            .add_package(PackageSource::Path(source), DeploymentOptions::None)
            .expect("must install fixture");
    }

    let count = |pattern: &str| {
        manager
            .find_packages(pattern)
            .expect("must enumerate packages")
            .len()
    };
    assert_eq!(count("*"), 3);
    assert_eq!(count("App*"), 2);
    assert_eq!(count("app*"), 2);
    assert_eq!(count("Other*"), 0);
    assert_eq!(count("Tool_h91ms92gdsmmt"), 1);

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn shared_content_survives_until_last_referencing_package_is_removed() {
    let layout = test_layout();
    let fixtures = layout.prefix().join("fixtures");
    let manager = self_hosted_manager(&layout);
    for name in ["First", "Second"] {
        let source = write_package_fixture(&fixtures, name, "1.0.0.0");
        manager
            .add_package(PackageSource::Path(source), DeploymentOptions::None)
            .expect("must install fixture");
    }
    let shared = layout.shared_dir().join("SystemX64").join("shared.dll");
    let first_exe = layout
        .shared_dir()
        .join("ProgramFilesX64")
        .join("First")
        .join("First.exe");
    assert!(shared.is_file());
    assert!(first_exe.is_file());

    manager
        .remove_package(&full_name_of("First", "1.0.0.0"))
        .expect("must remove first package");
    assert!(shared.is_file(), "shared file still referenced by Second");
    assert!(!first_exe.exists(), "unreferenced shared file must be removed");
    assert!(!layout
        .package_dir(&full_name_of("First", "1.0.0.0"))
        .exists());

    manager
        .remove_package(&full_name_of("Second", "1.0.0.0"))
        .expect("must remove second package");
    assert!(!shared.exists());
    assert!(manager
        .find_packages("*")
        .expect("must enumerate packages")
        .is_empty());

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn remove_missing_package_reports_not_found() {
    let layout = test_layout();
    let manager = self_hosted_manager(&layout);

    let err = manager
        .remove_package(&full_name_of("Missing", "1.0.0.0"))
        .expect_err("must fail for missing package");
    assert_eq!(error_code(&err), ERROR_NOT_FOUND);

    let (callback, seen) = recording_callback();
    let handle = manager
        .remove_package_async(&full_name_of("Missing", "1.0.0.0"), Some(callback))
        .expect("must start removal");
    let response = handle.wait();
    assert_eq!(response.status(), InstallationStep::Error);
    assert_eq!(response.error_code(), Some(ERROR_NOT_FOUND));
    assert_progress_well_formed(&seen.lock());

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn remove_rejects_malformed_full_names_without_touching_disk() {
    let layout = test_layout();
    let fixtures = layout.prefix().join("fixtures");
    let source = write_package_fixture(&fixtures, "App", "1.0.0.0");
    let manager = self_hosted_manager(&layout);
    manager
        .add_package(PackageSource::Path(source), DeploymentOptions::None)
        .expect("must install package");
    let full_name = full_name_of("App", "1.0.0.0");

    for name in [
        "",
        ".",
        "..",
        "a/b",
        "packages",
        "App_1.0.0.0_x64__h91ms92gdsmmt/..",
        "..\\App_1.0.0.0_x64__h91ms92gdsmmt",
    ] {
        let err = manager
            .remove_package(name)
            .expect_err("must reject malformed full name");
        assert_eq!(
            error_code(&err),
            msixcore_core::ERROR_INVALID_DATA,
            "unexpected error for '{name}': {err:#}"
        );
        assert!(manager
            .find_package(name)
            .expect("malformed lookup must be a miss")
            .is_none());
        assert!(remove_package_content(manager.registry(), name, &mut |_| {}).is_err());
    }

    assert!(layout.packages_dir().is_dir());
    assert!(manager
        .find_package(&full_name)
        .expect("must query registry")
        .is_some());
    assert!(layout
        .shared_dir()
        .join("SystemX64")
        .join("shared.dll")
        .is_file());

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn failed_shared_deploy_rolls_back_promoted_package() {
    let layout = test_layout();
    let fixtures = layout.prefix().join("fixtures");
    let source = write_package_fixture(&fixtures, "App", "1.0.0.0");
    let manager = self_hosted_manager(&layout);
    fs::create_dir_all(layout.shared_dir()).expect("must create shared dir");
    fs::write(layout.shared_dir().join("SystemX64"), b"not a directory")
        .expect("must block shared dir");

    let (callback, seen) = recording_callback();
    let response = manager
        .add_package_async(
            PackageSource::Path(source),
            DeploymentOptions::None,
            Some(callback),
        )
        .expect("must start install")
        .wait();
    assert_eq!(response.status(), InstallationStep::Error);
    assert_progress_well_formed(&seen.lock());

    let full_name = full_name_of("App", "1.0.0.0");
    assert!(manager
        .find_package(&full_name)
        .expect("must query registry")
        .is_none());
    assert!(!layout.package_dir(&full_name).exists());
    assert!(manager
        .find_packages("*")
        .expect("must enumerate packages")
        .is_empty());
    assert!(!layout
        .shared_dir()
        .join("ProgramFilesX64")
        .join("App")
        .join("App.exe")
        .exists());

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn failed_copy_fallback_removes_partial_destination() {
    let root = tempfile::tempdir().expect("must create temp dir");
    let src = root.path().join("staged");
    let dst = root.path().join("installed");
    fs::create_dir_all(src.join("VFS")).expect("must create staged VFS dir");
    fs::write(src.join("AppxManifest.xml"), b"manifest").expect("must write staged file");
    fs::create_dir_all(&dst).expect("must create destination");
    // Non-empty destination forces rename to fail; a file named like the
    // staged directory makes the copy fallback fail partway through.
    fs::write(dst.join("VFS"), b"blocker").expect("must write blocker");

    staging::move_dir_or_copy(&src, &dst).expect_err("must fail when copy fallback fails");

    assert!(!dst.exists(), "partial copy must be removed");
    assert!(src.join("AppxManifest.xml").exists(), "staged content must survive");
}

#[test]
fn async_install_reports_extraction_then_completion() {
    let layout = test_layout();
    let fixtures = layout.prefix().join("fixtures");
    let source = write_package_fixture(&fixtures, "App", "1.0.0.0");
    let manager = self_hosted_manager(&layout);

    let (callback, seen) = recording_callback();
    let mut handle = manager
        .add_package_async(
            PackageSource::Path(source),
            DeploymentOptions::None,
            Some(callback),
        )
        .expect("must start install");
    let _ = handle.status();
    let response = handle.wait();
    assert!(response.is_success());
    assert_eq!(response.percentage(), 100.0);

    let responses = seen.lock().clone();
    assert!(responses.len() >= 2);
    assert_progress_well_formed(&responses);
    assert_eq!(responses[0].status(), InstallationStep::Started);
    let extraction_index = responses
        .iter()
        .position(|response| response.status() == InstallationStep::Extraction)
        .expect("must report extraction");
    assert!(extraction_index < responses.len() - 1);
    let last = responses.last().expect("must have responses");
    assert_eq!(last.status(), InstallationStep::Completed);
    assert_eq!(last.percentage(), 100.0);
    assert!(
        responses
            .iter()
            .filter(|response| !response.is_terminal())
            .all(|response| response.percentage() < 100.0),
        "only the completed response may report 100: {responses:?}"
    );

    assert!(manager
        .find_package(&full_name_of("App", "1.0.0.0"))
        .expect("must query registry")
        .is_some());

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn install_from_file_uses_unpacker_and_decodes_entry_names() {
    let layout = test_layout();
    let fixtures = layout.prefix().join("fixtures");
    let content = write_package_fixture(&fixtures, "App", "1.0.0.0");
    fs::write(content.join("read%20me.txt"), b"notes").expect("must write encoded entry");
    let package = write_package_file(&fixtures);
    let manager = self_hosted_manager(&layout).with_unpacker(Arc::new(DirectoryUnpacker {
        content: content.clone(),
    }));

    manager
        .add_package(PackageSource::Path(package), DeploymentOptions::None)
        .expect("must install package file");

    let package_dir = layout.package_dir(&full_name_of("App", "1.0.0.0"));
    assert!(package_dir.join("read me.txt").is_file());
    assert!(!package_dir.join("read%20me.txt").exists());
    assert!(fs::read_dir(layout.tmp_dir())
        .expect("must read tmp dir")
        .next()
        .is_none());

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn install_from_url_downloads_then_installs() {
    let layout = test_layout();
    let fixtures = layout.prefix().join("fixtures");
    let content = write_package_fixture(&fixtures, "App", "1.0.0.0");
    let manager = self_hosted_manager(&layout).with_unpacker(Arc::new(DirectoryUnpacker {
        content,
    }));
    let (url, server) = start_one_shot_http_server(b"PK\x03\x04".to_vec());

    manager
        .add_package(PackageSource::parse(&url), DeploymentOptions::None)
        .expect("must install downloaded package");
    server.join().expect("server thread must finish");

    assert!(layout.download_cache_path(&url).is_file());
    assert!(manager
        .find_package(&full_name_of("App", "1.0.0.0"))
        .expect("must query registry")
        .is_some());

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn get_package_info_reads_file_without_installing() {
    let layout = test_layout();
    let fixtures = layout.prefix().join("fixtures");
    let content = write_package_fixture(&fixtures, "App", "2.1.0.0");
    let package_file = write_package_file(&fixtures);
    let manager = self_hosted_manager(&layout).with_unpacker(Arc::new(DirectoryUnpacker {
        content: content.clone(),
    }));

    let package = manager
        .get_package_info(&package_file)
        .expect("must read package info");
    assert_eq!(package.full_name().as_str(), full_name_of("App", "2.1.0.0"));
    assert_eq!(package.publisher_display_name(), "Contoso");
    assert!(package.capabilities().contains("runFullTrust"));
    assert!(matches!(package.logo_source(), Some(LogoSource::Bytes(_))));
    let mut logo = Vec::new();
    package
        .logo()
        .expect("must open logo")
        .expect("must have logo")
        .read_to_end(&mut logo)
        .expect("must read logo");
    assert_eq!(logo, b"png");

    let from_dir = manager
        .get_package_info(&content)
        .expect("must read unpacked package");
    assert_eq!(from_dir.full_name(), package.full_name());
    assert!(manager
        .find_packages("*")
        .expect("must enumerate packages")
        .is_empty());

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn newer_version_replaces_older_and_downgrade_is_rejected() {
    let layout = test_layout();
    let fixtures = layout.prefix().join("fixtures");
    let older = write_package_fixture(&fixtures, "App", "1.0.0.0");
    let newer = write_package_fixture(&fixtures, "App", "2.0.0.0");
    let manager = self_hosted_manager(&layout);

    manager
        .add_package(PackageSource::Path(older.clone()), DeploymentOptions::None)
        .expect("must install older version");
    manager
        .add_package(PackageSource::Path(newer), DeploymentOptions::None)
        .expect("must install newer version");

    assert!(manager
        .find_package(&full_name_of("App", "1.0.0.0"))
        .expect("must query registry")
        .is_none());
    let current = manager
        .find_package_by_family_name("App_h91ms92gdsmmt")
        .expect("must query by family")
        .expect("must find family");
    assert_eq!(current.full_name().as_str(), full_name_of("App", "2.0.0.0"));
    assert!(layout
        .shared_dir()
        .join("SystemX64")
        .join("shared.dll")
        .is_file());

    let err = manager
        .add_package(PackageSource::Path(older), DeploymentOptions::None)
        .expect_err("must reject downgrade");
    assert_eq!(error_code(&err), ERROR_INSTALL_PACKAGE_DOWNGRADE);
    assert!(manager
        .find_package(&full_name_of("App", "2.0.0.0"))
        .expect("must query registry")
        .is_some());

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn reinstalling_same_full_name_replaces_content() {
    let layout = test_layout();
    let fixtures = layout.prefix().join("fixtures");
    let source = write_package_fixture(&fixtures, "App", "1.0.0.0");
    let manager = self_hosted_manager(&layout);
    let package_dir = layout.package_dir(&full_name_of("App", "1.0.0.0"));

    manager
        .add_package(PackageSource::Path(source.clone()), DeploymentOptions::None)
        .expect("must install package");
    fs::write(package_dir.join("stale.txt"), b"stale").expect("must write stale file");

    manager
        .add_package(PackageSource::Path(source), DeploymentOptions::None)
        .expect("must reinstall package");
    assert!(!package_dir.join("stale.txt").exists());
    assert_eq!(
        manager
            .find_packages("*")
            .expect("must enumerate packages")
            .len(),
        1
    );

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn concurrent_operation_on_same_full_name_is_rejected() {
    let layout = test_layout();
    let fixtures = layout.prefix().join("fixtures");
    let source = write_package_fixture(&fixtures, "App", "1.0.0.0");
    let in_flight = Arc::new(InFlightPackages::default());
    let installer = SelfHostedInstaller::new(
        layout.clone(),
        Arc::new(CommandUnpacker),
        Arc::clone(&in_flight),
        Duration::from_secs(5),
    );

    let claim = in_flight
        .claim(&full_name_of("App", "1.0.0.0"))
        .expect("must claim package");
    let err = installer
        .install_package(
            PackageSource::Path(source.clone()),
            DeploymentOptions::None,
            &mut ProgressReporter::detached(),
        )
        .expect_err("must reject concurrent install");
    assert_eq!(error_code(&err), ERROR_BUSY);
    assert!(!layout.package_dir(&full_name_of("App", "1.0.0.0")).exists());

    drop(claim);
    installer
        .install_package(
            PackageSource::Path(source),
            DeploymentOptions::None,
            &mut ProgressReporter::detached(),
        )
        .expect("must install once the claim is released");

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn cancelled_install_leaves_nothing_behind() {
    let layout = test_layout();
    let fixtures = layout.prefix().join("fixtures");
    let content = write_package_fixture(&fixtures, "App", "1.0.0.0");
    let package = write_package_file(&fixtures);
    let (started_sender, started) = crossbeam_channel::unbounded();
    let (release, release_receiver) = crossbeam_channel::unbounded();
    let manager = self_hosted_manager(&layout).with_unpacker(Arc::new(BlockingUnpacker {
        content,
        started: started_sender,
        release: release_receiver,
    }));

    let handle = manager
        .add_package_async(PackageSource::Path(package), DeploymentOptions::None, None)
        .expect("must start install");
    started
        .recv_timeout(Duration::from_secs(10))
        .expect("unpacker must start");
    handle.cancel();
    release.send(()).expect("must release unpacker");

    let response = handle.wait();
    assert_eq!(response.status(), InstallationStep::Error);
    assert_eq!(response.error_code(), Some(ERROR_INSTALL_USEREXIT));
    assert!(!layout.package_dir(&full_name_of("App", "1.0.0.0")).exists());
    assert!(fs::read_dir(layout.tmp_dir())
        .expect("must read tmp dir")
        .next()
        .is_none());

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn native_service_progress_is_relayed_and_completion_is_single() {
    let layout = test_layout();
    let package = write_package_file({
        fs::create_dir_all(layout.prefix()).expect("must create prefix");
        layout.prefix()
    });
    let service = Arc::new(RecordingNativeService {
        progress: vec![10, 50, 100],
        ..RecordingNativeService::default()
    });
    let manager = PackageManager::with_layout(layout.clone())
        .expect("must create package manager")
        .with_native_service(service.clone())
        .with_host_version(NATIVE_HOST);
    assert_eq!(manager.strategy(), DeploymentStrategy::NativeService);

    let (callback, seen) = recording_callback();
    let response = manager
        .add_package_async(
            PackageSource::Path(package.clone()),
            DeploymentOptions::None,
            Some(callback),
        )
        .expect("must start install")
        .wait();
    assert!(response.is_success());

    let responses = seen.lock().clone();
    assert_progress_well_formed(&responses);
    let percentages = responses
        .iter()
        .filter(|response| response.status() == InstallationStep::Extraction)
        .map(Response::percentage)
        .collect::<Vec<_>>();
    assert_eq!(percentages, vec![10.0, 50.0]);
    assert!(responses
        .iter()
        .filter(|response| !response.is_terminal())
        .all(|response| response.percentage() < 100.0));
    assert_eq!(*service.added.lock(), vec![package]);

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn native_service_error_code_is_copied_to_response() {
    let layout = test_layout();
    let package = write_package_file({
        fs::create_dir_all(layout.prefix()).expect("must create prefix");
        layout.prefix()
    });
    let service = Arc::new(RecordingNativeService {
        progress: vec![25],
        failure: Some(0x8007_3CF3),
        ..RecordingNativeService::default()
    });
    let manager = PackageManager::with_layout(layout.clone())
        .expect("must create package manager")
        .with_native_service(service)
        .with_host_version(NATIVE_HOST);

    let response = manager
        .add_package_async(PackageSource::Path(package), DeploymentOptions::None, None)
        .expect("must start install")
        .wait();
    assert_eq!(response.status(), InstallationStep::Error);
    assert_eq!(response.error_code(), Some(0x8007_3CF3));
    assert_eq!(response.percentage(), 25.0);
    assert!(response
        .error_text()
        .is_some_and(|text| text.contains("conflicts")));

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn native_service_stream_is_materialized_and_removed() {
    let layout = test_layout();
    let service = Arc::new(RecordingNativeService::default());
    let manager = PackageManager::with_layout(layout.clone())
        .expect("must create package manager")
        .with_native_service(service.clone())
        .with_host_version(NATIVE_HOST);

    manager
        .add_package(
            PackageSource::from_reader(io::Cursor::new(b"streamed".to_vec())),
            DeploymentOptions::None,
        )
        .expect("must deploy stream");

    assert_eq!(*service.payloads.lock(), vec![b"streamed".to_vec()]);
    let added = service.added.lock().clone();
    assert_eq!(added.len(), 1);
    assert!(!added[0].exists(), "materialized file must be deleted");

    manager
        .remove_package(&full_name_of("App", "1.0.0.0"))
        .expect("must remove through service");
    assert_eq!(
        *service.removed.lock(),
        vec![full_name_of("App", "1.0.0.0")]
    );

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn native_service_is_not_invoked_when_stream_fails() {
    let layout = test_layout();
    let service = Arc::new(RecordingNativeService::default());
    let manager = PackageManager::with_layout(layout.clone())
        .expect("must create package manager")
        .with_native_service(service.clone())
        .with_host_version(NATIVE_HOST);

    let err = manager
        .add_package(PackageSource::from_reader(FailingReader), DeploymentOptions::None)
        .expect_err("must fail to materialize");
    assert!(format!("{err:#}").contains("stream interrupted"));
    assert!(service.added.lock().is_empty());

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn unavailable_native_service_reports_not_supported() {
    let layout = test_layout();
    let package = write_package_file({
        fs::create_dir_all(layout.prefix()).expect("must create prefix");
        layout.prefix()
    });
    let manager = PackageManager::with_layout(layout.clone())
        .expect("must create package manager")
        .with_native_service(Arc::new(UnavailableDeploymentService))
        .with_host_version(NATIVE_HOST);

    let err = manager
        .add_package(PackageSource::Path(package), DeploymentOptions::None)
        .expect_err("must fail without service");
    assert_eq!(error_code(&err), ERROR_NOT_SUPPORTED);

    let _ = fs::remove_dir_all(layout.prefix());
}
