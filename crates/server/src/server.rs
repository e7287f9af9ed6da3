//! TCP listener.
//!
//! Nonblocking accept loop on its own thread, polling a shutdown flag
//! between accepts; each accepted connection gets a session thread and
//! a process-unique connection id. Session threads are not joined on
//! shutdown — each one notices its peer or socket going away and winds
//! down on its own.

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};

use gridserve_config::Settings;

use crate::registry::Registry;
use crate::session::{run_session, SessionContext};

const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Handle to the running listener. `stop` (or drop) flips the shutdown
/// flag and joins the accept loop.
pub struct Server {
    handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    bound_addr: SocketAddr,
}

impl Server {
    /// Bind and start accepting. Port 0 binds an ephemeral port;
    /// `bound_addr` reports what the OS picked.
    pub fn start(settings: &Settings, registry: Arc<Registry>) -> io::Result<Self> {
        let listener =
            TcpListener::bind((settings.listen_host.as_str(), settings.listen_port))?;
        listener.set_nonblocking(true)?;
        let bound_addr = listener.local_addr()?;

        let ctx = Arc::new(SessionContext::new(settings, registry));
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = Arc::clone(&shutdown);

        let handle = thread::Builder::new()
            .name("listener".into())
            .spawn(move || run_listener(listener, ctx, thread_shutdown))?;

        info!("listening on {}", bound_addr);
        Ok(Self {
            handle: Some(handle),
            shutdown,
            bound_addr,
        })
    }

    pub fn bound_addr(&self) -> SocketAddr {
        self.bound_addr
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_listener(listener: TcpListener, ctx: Arc<SessionContext>, shutdown: Arc<AtomicBool>) {
    // Id 0 is reserved for the directory monitor's unload path.
    let next_conn_id = AtomicU64::new(1);

    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let conn_id = next_conn_id.fetch_add(1, Ordering::SeqCst);
                debug!("conn {}: accepted from {}", conn_id, peer);
                let session_ctx = Arc::clone(&ctx);
                let spawned = thread::Builder::new()
                    .name(format!("conn-{}", conn_id))
                    .spawn(move || {
                        // Accepted sockets may inherit the listener's
                        // nonblocking mode.
                        if stream.set_nonblocking(false).is_ok() {
                            run_session(stream, conn_id, &session_ctx);
                        }
                    });
                if let Err(err) = spawned {
                    warn!("conn {}: cannot spawn session thread: {}", conn_id, err);
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                warn!("accept failed: {}", err);
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
    debug!("listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{reconcile, MonitorConfig};
    use crate::registry::Resource;
    use gridserve_engine::{JsonEngine, Workbook};
    use gridserve_protocol::{read_frame, write_frame, Received};
    use serde_json::{json, Value};
    use std::fs;
    use std::net::TcpStream;
    use std::path::Path;

    fn write_doc(dir: &Path, name: &str, body: &str) {
        fs::write(dir.join(name), body).unwrap();
    }

    fn load_docs(registry: &Registry, dir: &Path) {
        let config = MonitorConfig {
            documents_dir: dir.to_path_buf(),
            poll_interval: Duration::from_secs(60),
            reload_on_change: true,
        };
        reconcile(&config, registry, &JsonEngine);
    }

    fn test_settings(docs: &Path, save: &Path) -> Settings {
        let mut settings = Settings::default();
        settings.listen_host = "127.0.0.1".to_string();
        settings.listen_port = 0;
        settings.documents_dir = docs.to_path_buf();
        settings.save_dir = save.to_path_buf();
        settings.poll_interval_secs = 0;
        settings
    }

    fn connect(server: &Server) -> TcpStream {
        let stream = TcpStream::connect(server.bound_addr()).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    fn send(stream: &mut TcpStream, value: &Value) {
        write_frame(stream, value).unwrap();
    }

    fn recv(stream: &mut TcpStream) -> Value {
        match read_frame(stream).unwrap() {
            Received::Frame(value) => value,
            Received::Closed => panic!("server closed the connection"),
        }
    }

    fn bind(stream: &mut TcpStream, name: &str) {
        send(stream, &json!(["SPREADSHEET", name]));
        assert_eq!(recv(stream), json!("OK"));
    }

    #[test]
    fn set_get_and_sheet_listing() {
        let docs = tempfile::tempdir().unwrap();
        let save = tempfile::tempdir().unwrap();
        write_doc(docs.path(), "book.json", "[[1, 2], [3, 4]]");

        let registry = Arc::new(Registry::new());
        load_docs(&registry, docs.path());
        let server =
            Server::start(&test_settings(docs.path(), save.path()), registry).unwrap();

        let mut client = connect(&server);
        bind(&mut client, "book.json");

        send(&mut client, &json!(["GET", "Sheet1", "A1"]));
        assert_eq!(recv(&mut client), json!(1.0));

        send(&mut client, &json!(["SET", "Sheet1", "A1", 5]));
        assert_eq!(recv(&mut client), json!("OK"));
        send(&mut client, &json!(["GET", "Sheet1", "A1"]));
        assert_eq!(recv(&mut client), json!(5.0));

        send(&mut client, &json!(["SET", 0, "B1:B3", [4, 5, 6]]));
        assert_eq!(recv(&mut client), json!("OK"));
        send(&mut client, &json!(["GET", 0, "B1:B3"]));
        assert_eq!(recv(&mut client), json!([4.0, 5.0, 6.0]));

        send(&mut client, &json!(["GET_SHEETS"]));
        assert_eq!(recv(&mut client), json!(["Sheet1"]));
    }

    #[test]
    fn unknown_document_is_not_found() {
        let docs = tempfile::tempdir().unwrap();
        let save = tempfile::tempdir().unwrap();
        let registry = Arc::new(Registry::new());
        let server =
            Server::start(&test_settings(docs.path(), save.path()), registry).unwrap();

        let mut client = connect(&server);
        send(&mut client, &json!(["SPREADSHEET", "nope.json"]));
        assert_eq!(recv(&mut client), json!("NOT FOUND"));
    }

    #[test]
    fn non_handshake_first_frame_is_a_protocol_error() {
        let docs = tempfile::tempdir().unwrap();
        let save = tempfile::tempdir().unwrap();
        let registry = Arc::new(Registry::new());
        let server =
            Server::start(&test_settings(docs.path(), save.path()), registry).unwrap();

        let mut client = connect(&server);
        send(&mut client, &json!(["GET", "Sheet1", "A1"]));
        assert_eq!(recv(&mut client), json!("PROTOCOL ERROR"));
    }

    #[test]
    fn validation_errors_keep_the_session_alive() {
        let docs = tempfile::tempdir().unwrap();
        let save = tempfile::tempdir().unwrap();
        write_doc(docs.path(), "book.json", "[[1]]");

        let registry = Arc::new(Registry::new());
        load_docs(&registry, docs.path());
        let server =
            Server::start(&test_settings(docs.path(), save.path()), registry).unwrap();

        let mut client = connect(&server);
        bind(&mut client, "book.json");

        // Past the last valid column
        send(&mut client, &json!(["SET", "Sheet1", "AMK1", 1]));
        assert_eq!(recv(&mut client), json!({"ERROR": "Cell range is invalid."}));

        send(&mut client, &json!(["GET", "Sheet1", "XYZ"]));
        assert_eq!(recv(&mut client), json!({"ERROR": "Cell range is invalid."}));

        send(&mut client, &json!(["FROBNICATE"]));
        let reply = recv(&mut client);
        assert!(reply.get("ERROR").is_some());

        // Session still works
        send(&mut client, &json!(["GET", "Sheet1", "A1"]));
        assert_eq!(recv(&mut client), json!(1.0));
    }

    #[test]
    fn malformed_json_frames_get_a_fixed_error_reply() {
        let docs = tempfile::tempdir().unwrap();
        let save = tempfile::tempdir().unwrap();
        write_doc(docs.path(), "book.json", "[[1]]");

        let registry = Arc::new(Registry::new());
        load_docs(&registry, docs.path());
        let server =
            Server::start(&test_settings(docs.path(), save.path()), registry).unwrap();

        let mut client = connect(&server);
        bind(&mut client, "book.json");

        // Well-framed, but the payload is not JSON
        use std::io::Write as _;
        let payload = b"{not json";
        let mut raw = (payload.len() as u32).to_be_bytes().to_vec();
        raw.extend_from_slice(payload);
        client.write_all(&raw).unwrap();

        assert_eq!(recv(&mut client), json!({"ERROR": "Malformed request."}));

        // Session still works
        send(&mut client, &json!(["GET", "Sheet1", "A1"]));
        assert_eq!(recv(&mut client), json!(1.0));
    }

    #[test]
    fn second_connection_waits_for_the_lock() {
        let docs = tempfile::tempdir().unwrap();
        let save = tempfile::tempdir().unwrap();
        write_doc(docs.path(), "book.json", "[[1]]");

        let registry = Arc::new(Registry::new());
        load_docs(&registry, docs.path());
        let server =
            Server::start(&test_settings(docs.path(), save.path()), registry).unwrap();

        let mut first = connect(&server);
        bind(&mut first, "book.json");

        let mut second = connect(&server);
        send(&mut second, &json!(["SPREADSHEET", "book.json"]));

        // The second handshake cannot complete while the first holds
        // the lock.
        thread::sleep(Duration::from_millis(200));
        drop(first);

        assert_eq!(recv(&mut second), json!("OK"));
        send(&mut second, &json!(["SET", "Sheet1", "A1", 9]));
        assert_eq!(recv(&mut second), json!("OK"));
    }

    #[test]
    fn bind_wait_is_bounded() {
        let docs = tempfile::tempdir().unwrap();
        let save = tempfile::tempdir().unwrap();
        write_doc(docs.path(), "book.json", "[[1]]");

        let registry = Arc::new(Registry::new());
        load_docs(&registry, docs.path());
        let mut settings = test_settings(docs.path(), save.path());
        settings.bind_timeout_secs = 0;
        let server = Server::start(&settings, registry).unwrap();

        let mut first = connect(&server);
        bind(&mut first, "book.json");

        let mut second = connect(&server);
        send(&mut second, &json!(["SPREADSHEET", "book.json"]));
        assert_eq!(
            recv(&mut second),
            json!({"ERROR": "Timed out waiting for exclusive access."})
        );
    }

    #[test]
    fn save_writes_into_the_save_directory() {
        let docs = tempfile::tempdir().unwrap();
        let save = tempfile::tempdir().unwrap();
        write_doc(docs.path(), "book.json", "[[7]]");

        let registry = Arc::new(Registry::new());
        load_docs(&registry, docs.path());
        let server =
            Server::start(&test_settings(docs.path(), save.path()), registry).unwrap();

        let mut client = connect(&server);
        bind(&mut client, "book.json");

        send(&mut client, &json!(["SAVE", "copy.json"]));
        assert_eq!(recv(&mut client), json!("OK"));
        assert!(save.path().join("copy.json").is_file());
    }

    #[test]
    fn handshake_retries_until_the_document_appears() {
        let docs = tempfile::tempdir().unwrap();
        let save = tempfile::tempdir().unwrap();

        let registry = Arc::new(Registry::new());
        let mut settings = test_settings(docs.path(), save.path());
        // Three lookup attempts, one second apart
        settings.poll_interval_secs = 2;
        let server = Server::start(&settings, Arc::clone(&registry)).unwrap();

        let addr = server.bound_addr();
        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(10)))
                .unwrap();
            write_frame(&mut stream, &json!(["SPREADSHEET", "late.json"])).unwrap();
            read_frame(&mut stream).unwrap()
        });

        thread::sleep(Duration::from_millis(300));
        registry.insert(Arc::new(Resource::new(
            "late.json",
            blake3::hash(b"late"),
            Box::new(Workbook::with_sheet("Sheet1")),
        )));

        assert_eq!(client.join().unwrap(), Received::Frame(json!("OK")));
    }
}
