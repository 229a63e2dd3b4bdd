// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::path::Path;

use rstest::rstest;

use super::{handshake, mount, server_launch};
use crate::Error;
use crate::endpoint::EndpointPair;
use crate::fixtures::*;
use crate::launcher::ProcessSpawner;
use crate::request::{Backend, MountRequest};

#[rstest]
#[case::plain(MountRequest::new("/spfs"), &["--rwsize=131072", "/spfs"])]
#[case::read_only(
    MountRequest::new("/spfs").with_read_only(true),
    &["-r", "--rwsize=131072", "/spfs"],
)]
#[case::named(
    MountRequest::new("/mnt/vault").with_read_only(true).with_display_name("vault"),
    &["-r", "--volname=vault", "--rwsize=131072", "/mnt/vault"],
)]
#[case::empty_name(
    MountRequest::new("/spfs").with_display_name(""),
    &["--rwsize=131072", "/spfs"],
)]
fn test_server_arguments(#[case] request: MountRequest, #[case] expected: &[&str]) {
    let launch = server_launch(Path::new("/usr/local/bin/go-nfsv4"), &request, 128 * 1024);
    let args: Vec<_> = launch.args().iter().map(|a| a.to_str().unwrap()).collect();
    assert_eq!(args, expected);
    assert!(launch.is_detached());
    assert!(!launch.captures_output());
    assert_eq!(launch.env_var("_FUSE_COMMFD").unwrap(), "3");
    assert_eq!(launch.env_var("_FUSE_MONFD").unwrap(), "4");
    assert_eq!(launch.env_var("_FUSE_COMMVERS").unwrap(), "2");
}

#[rstest]
#[case::accepted(&[0, 0, 0, 0], true)]
#[case::rejected(&[1, 0, 0, 0], false)]
#[case::last_byte(&[0, 0, 0, 7], false)]
#[case::short(&[0, 0], false)]
#[case::nothing(&[], false)]
#[serial_test::serial]
fn test_handshake_reply(#[case] reply: &'static [u8], #[case] accepted: bool) {
    let pair = EndpointPair::new("monitor").unwrap();
    let server = std::thread::spawn(move || {
        let mut request = [0u8; 5];
        (&pair.remote).read_exact(&mut request).unwrap();
        (&pair.remote).write_all(reply).unwrap();
        request
        // the remote end closes here, ending any short reply
    });

    let result = handshake(&pair.local);
    assert_eq!(&server.join().unwrap(), b"mount");
    match result {
        Ok(()) => assert!(accepted, "reply {reply:?} should be rejected"),
        Err(Error::HandshakeFailure(_)) => assert!(!accepted, "reply {reply:?} should be accepted"),
        Err(err) => panic!("unexpected error: {err:?}"),
    }
}

#[rstest]
#[serial_test::serial]
fn test_handshake_server_gone() {
    let EndpointPair { local, remote } = EndpointPair::new("monitor").unwrap();
    drop(remote);
    let err = handshake(&local).unwrap_err();
    assert!(matches!(err, Error::HandshakeFailure(_)), "{err:?}");
}

#[rstest]
#[tokio::test]
#[serial_test::serial]
async fn test_mount_with_fake_server(tmpdir: tempfile::TempDir) {
    init_logging();
    let program = install_placeholder(tmpdir.path(), "go-nfsv4");
    let spawner = FakeSpawner::new().with_behavior(
        &program,
        Behavior::Reply {
            reply: vec![0, 0, 0, 0],
        },
    );
    let request = MountRequest::new("/mnt/vault").with_display_name("vault");

    let mut handoff = mount(&spawner, &program, &request, 4096).unwrap();
    handoff.ready.wait().await.expect("mount should become ready");

    assert_eq!(handoff.outcome.backend, Backend::FuseT);
    assert_eq!(handoff.outcome.retained.len(), 1);
    assert!(handoff.outcome.channel.as_raw_fd() >= 0);
    assert!(handoff.termination.next().await.is_none());

    let launches = spawner.launches();
    assert_eq!(launches.len(), 1);
    let launch = &launches[0];
    assert_eq!(launch.slots, vec![3, 4]);
    assert_eq!(
        launch.args_lossy(),
        vec!["--volname=vault", "--rwsize=4096", "/mnt/vault"]
    );
    assert_eq!(launch.env["_FUSE_MONFD"], "4");
    assert!(launch.detach);
}

#[rstest]
#[tokio::test]
#[serial_test::serial]
async fn test_mount_rejected_by_server(tmpdir: tempfile::TempDir) {
    init_logging();
    let program = install_placeholder(tmpdir.path(), "go-nfsv4");
    let spawner = FakeSpawner::new().with_behavior(
        &program,
        Behavior::Reply {
            reply: vec![1, 0, 0, 0],
        },
    );

    let handoff = mount(&spawner, &program, &MountRequest::new("/spfs"), 4096)
        .expect("setup succeeds, the rejection arrives through readiness");
    let err = handoff.ready.wait().await.unwrap_err();
    assert!(matches!(err, Error::HandshakeFailure(_)), "{err:?}");
}

#[rstest]
#[tokio::test]
#[serial_test::serial]
async fn test_mount_spawn_failure_is_reported_directly(tmpdir: tempfile::TempDir) {
    init_logging();
    let program = tmpdir.path().join("go-nfsv4");
    let before = open_descriptor_count();
    let err = mount(&FakeSpawner::new(), &program, &MountRequest::new("/spfs"), 4096).unwrap_err();
    assert!(matches!(err, Error::HelperSpawnFailure { .. }), "{err:?}");
    assert_eq!(open_descriptor_count(), before, "failed attempt leaked descriptors");
}

#[rstest]
#[tokio::test]
#[serial_test::serial]
async fn test_mount_with_script_server(tmpdir: tempfile::TempDir) {
    init_logging();
    let args_file = tmpdir.path().join("args");
    let program = write_script(
        tmpdir.path(),
        "go-nfsv4",
        &format!(
            "printf '%s\\n' \"$@\" > '{}'\nhead -c 5 <&4 >/dev/null\nprintf '\\000\\000\\000\\000' >&4",
            args_file.display()
        ),
    );
    let request = MountRequest::new("/mnt/vault").with_read_only(true);

    let handoff = mount(&ProcessSpawner, &program, &request, 65536).unwrap();
    handoff.ready.wait().await.expect("script server should accept");

    let args = std::fs::read_to_string(&args_file).unwrap();
    assert_eq!(args, "-r\n--rwsize=65536\n/mnt/vault\n");
}
