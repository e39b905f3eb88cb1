use super::super::*;

pub(super) mod prelude {
    pub(crate) use serde_json::{json, Value};
    pub(crate) use std::{path::PathBuf, sync::Arc, time::Duration};
    pub(crate) use tokio::time;
}

use prelude::*;
use std::{fs, os::unix::fs::PermissionsExt};

/// Generous bound for anything that should complete promptly.
pub(super) const PROMPT: Duration = Duration::from_secs(5);

pub(super) fn write_script(name: &str, script: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let script_path = dir.path().join(name);
    fs::write(&script_path, script).expect("write script");
    let mut perms = fs::metadata(&script_path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&script_path, perms).expect("chmod");
    (dir, script_path)
}

/// Stub child understanding a small command vocabulary used by the tests.
pub(super) fn write_stub_child() -> (tempfile::TempDir, PathBuf) {
    let script = r#"#!/usr/bin/env python3
import json
import os
import random
import sys
import threading
import time

lock = threading.Lock()
swapped = []
held = 0

def send(payload):
    with lock:
        sys.stdout.write(json.dumps(payload) + "\n")
        sys.stdout.flush()

def noise(text):
    with lock:
        sys.stdout.write(text + "\n")
        sys.stdout.flush()

noise("stub child starting")
noise(json.dumps({"tag": 999, "note": "missing ext"}))

while True:
    line = sys.stdin.readline()
    if not line:
        break
    msg = json.loads(line)
    tag = msg.get("tag")
    cmd = msg.get("cmd")
    ext = msg.get("ext") or {}
    if cmd == "uptime":
        send({"tag": tag, "ext": {"ms": 42}})
    elif cmd == "echo":
        send({"tag": tag, "ext": {"cmd": cmd, "tag": tag, "ext": ext}})
    elif cmd == "threaded":
        def worker(tag=tag, ext=ext):
            time.sleep(random.random() * 0.05)
            send({"tag": tag, "ext": {"tag": tag, "ext": ext}})
        threading.Thread(target=worker, daemon=True).start()
    elif cmd == "swap":
        swapped.append(msg)
        if len(swapped) == 2:
            for pending in reversed(swapped):
                send({"tag": pending["tag"], "ext": {"cmd": pending["cmd"], "ext": pending["ext"]}})
            swapped = []
    elif cmd == "slow":
        time.sleep(ext.get("ms", 0) / 1000.0)
        send({"tag": tag, "ext": {"slow": True}})
    elif cmd == "twice":
        send({"tag": tag, "ext": {"n": 1}})
        send({"tag": tag, "ext": {"n": 2}})
    elif cmd == "hold":
        held += 1
        if held >= ext.get("until", 1):
            sys.exit(ext.get("code", 0))
    elif cmd == "env":
        send({"tag": tag, "ext": {
            "cwd": os.getcwd(),
            "marker": os.environ.get("TAGWIRE_MARKER"),
            "home": os.environ.get("HOME"),
        }})
    elif cmd == "shutdown":
        send({"tag": tag, "ext": {}})
        sys.exit(ext.get("code", 0))
    elif cmd == "die":
        sys.exit(ext.get("code", 1))
    elif cmd == "ignore":
        pass
    else:
        noise("unknown command " + str(cmd))

sys.exit(int(os.environ.get("STUB_EXIT_ON_EOF", "0")))
"#;

    write_script("stub-child", script)
}

pub(super) fn stub_config(script: PathBuf) -> ChannelConfig {
    ChannelConfig::new(script)
        .stderr(StderrMode::Null)
        .shutdown_grace(Duration::from_secs(2))
}

pub(super) async fn open_stub_channel() -> (tempfile::TempDir, Channel) {
    let (dir, script) = write_stub_child();
    let channel = Channel::open(stub_config(script))
        .await
        .expect("spawn stub child");
    (dir, channel)
}

pub(super) async fn request(channel: &Channel, command: &str, ext: Value) -> Outcome {
    channel
        .request(command, ext, Some(PROMPT))
        .await
        .expect("channel open")
}

/// Polls until the channel has `count` requests registered.
pub(super) async fn wait_for_pending(channel: &Channel, count: usize) {
    time::timeout(PROMPT, async {
        while channel.pending() < count {
            time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("requests registered");
}
