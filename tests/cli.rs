use assert_cmd::Command;
use predicates::str::contains;
use std::net::{TcpListener, TcpStream};
use std::process::Stdio;
use std::thread;
use std::time::{Duration, Instant};

// A port nothing listens on once the listener is dropped.
fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

// Listeners are held until every port is picked so none is handed out twice.
fn free_ports(n: usize) -> Vec<u16> {
    let listeners: Vec<TcpListener> = (0..n)
        .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    listeners
        .iter()
        .map(|l| l.local_addr().unwrap().port())
        .collect()
}

#[test]
fn client_help_lists_subcommands() {
    Command::cargo_bin("murmur-client")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("put"))
        .stdout(contains("get"))
        .stdout(contains("watch"));
}

#[test]
fn client_put_requires_value() {
    Command::cargo_bin("murmur-client")
        .unwrap()
        .args(["put", "only.key"])
        .assert()
        .failure();
}

#[test]
fn client_get_fails_without_server() {
    let addr = format!("127.0.0.1:{}", closed_port());
    Command::cargo_bin("murmur-client")
        .unwrap()
        .args(["--addr", &addr, "get", "foo"])
        .assert()
        .failure()
        .stderr(contains("Error"));
}

#[test]
fn server_rejects_zero_nodes() {
    Command::cargo_bin("murmur-server")
        .unwrap()
        .args(["--nodes", "0"])
        .assert()
        .failure();
}

#[test]
fn server_exits_with_error_when_api_port_is_taken() {
    let ports = free_ports(2);
    let _taken = TcpListener::bind(("127.0.0.1", ports[0])).unwrap();

    Command::cargo_bin("murmur-server")
        .unwrap()
        .args(["--nodes", "1"])
        .args(["--api-port", &ports[0].to_string()])
        .args(["--gossip-port", &ports[1].to_string()])
        .timeout(Duration::from_secs(30))
        .assert()
        .failure()
        .stderr(contains("Failed to listen"));
}

#[cfg(unix)]
#[test]
fn server_exits_cleanly_on_sigterm() {
    let ports = free_ports(2);
    let mut server = std::process::Command::new(assert_cmd::cargo::cargo_bin("murmur-server"))
        .args(["--nodes", "1"])
        .args(["--api-port", &ports[0].to_string()])
        .args(["--gossip-port", &ports[1].to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("unable to spawn murmur-server");

    let deadline = Instant::now() + Duration::from_secs(10);
    while TcpStream::connect(("127.0.0.1", ports[0])).is_err() {
        assert!(Instant::now() < deadline, "server never started listening");
        thread::sleep(Duration::from_millis(100));
    }

    let killed = std::process::Command::new("kill")
        .args(["-TERM", &server.id().to_string()])
        .status()
        .expect("unable to run kill");
    assert!(killed.success());

    let deadline = Instant::now() + Duration::from_secs(30);
    let status = loop {
        if let Some(status) = server.try_wait().unwrap() {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = server.kill();
            panic!("server did not exit after SIGTERM");
        }
        thread::sleep(Duration::from_millis(100));
    };
    assert!(status.success(), "unexpected exit status: {status}");
}
