#![cfg(unix)]
// Integration tests for `AdbClient` against a scripted stand-in for `adb`.
//
// Everything runs inside one test so the script is written exactly once
// before any child process is forked.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use doorlock_api::{AdbClient, AdbConfig, Error, Point};

const FAKE_ADB: &str = r#"#!/bin/sh
if [ "$1" = "-s" ]; then
    shift 2
fi
case "$1" in
    connect)
        case "$2" in
            *offline*) echo "failed to connect to '$2': Connection refused" ;;
            *) echo "connected to $2" ;;
        esac
        ;;
    exec-out)
        printf 'PNGBYTES'
        ;;
    reboot)
        ;;
    shell)
        shift
        case "$1" in
            dumpsys)
                echo "    mResumedActivity: ActivityRecord{7a1 u0 com.alpha.lockapp/.MainActivity t42}"
                ;;
            sleep)
                sleep 5
                ;;
            fail)
                echo "device offline" >&2
                exit 3
                ;;
            *)
                echo "$@"
                ;;
        esac
        ;;
    *)
        exit 1
        ;;
esac
"#;

fn install_fake_adb(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("adb");
    std::fs::write(&path, FAKE_ADB).expect("write fake adb");
    let mut perms = std::fs::metadata(&path).expect("metadata").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod fake adb");
    path
}

fn client(adb_path: &Path, serial: &str, timeout: Duration) -> AdbClient {
    AdbClient::new(AdbConfig {
        adb_path: adb_path.to_path_buf(),
        serial: serial.into(),
        timeout,
    })
}

#[tokio::test]
async fn test_adb_client_against_scripted_device() {
    let dir = tempfile::tempdir().expect("tempdir");
    let adb = install_fake_adb(dir.path());
    let device = client(&adb, "192.168.11.135:5555", Duration::from_secs(5));

    // ── connect ────────────────────────────────────────────────────
    device.connect().await.expect("connect succeeds");

    let offline = client(&adb, "offline:5555", Duration::from_secs(5));
    let result = offline.connect().await;
    assert!(
        matches!(result, Err(Error::NotConnected { ref serial, .. }) if serial == "offline:5555"),
        "expected NotConnected, got: {result:?}"
    );

    // ── input ──────────────────────────────────────────────────────
    device.tap(Point::new(330, 1200)).await.expect("tap");
    device
        .swipe(Point::new(540, 1800), Point::new(540, 800), 300)
        .await
        .expect("swipe");

    let echoed = device.shell("input keyevent 26").await.expect("shell");
    assert_eq!(echoed.trim(), "input keyevent 26");

    // ── capture ────────────────────────────────────────────────────
    let png = device.screencap().await.expect("screencap");
    assert_eq!(&png[..], b"PNGBYTES");

    // ── activity ───────────────────────────────────────────────────
    let activity = device.resumed_activity().await.expect("dumpsys");
    assert_eq!(activity.as_deref(), Some("com.alpha.lockapp/.MainActivity"));

    device.reboot().await.expect("reboot");

    // ── failures ───────────────────────────────────────────────────
    let result = device.shell("fail").await;
    match result {
        Err(Error::CommandFailed { status, stderr, .. }) => {
            assert_eq!(status, Some(3));
            assert_eq!(stderr, "device offline");
        }
        other => panic!("expected CommandFailed, got: {other:?}"),
    }

    let impatient = client(&adb, "192.168.11.135:5555", Duration::from_millis(200));
    let result = impatient.shell("sleep").await;
    assert!(
        matches!(result, Err(Error::Timeout { timeout_ms: 200 })),
        "expected Timeout, got: {result:?}"
    );

    let missing = client(
        &dir.path().join("no-such-adb"),
        "192.168.11.135:5555",
        Duration::from_secs(1),
    );
    let result = missing.tap(Point::new(1, 1)).await;
    assert!(
        matches!(result, Err(Error::Spawn(_))),
        "expected Spawn, got: {result:?}"
    );
}
