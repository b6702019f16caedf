//! read-only HTTP view of a content store
//!
//! each file goes out with its owner, mode and xattrs in `X-Rootdeploy-*`
//! headers, which the pulling side needs to rebuild blobs.

use std::fs::File;
use std::net::{SocketAddr, TcpListener};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tiny_http::{Header, Method, Request, Response, Server};
use tracing::{debug, info, warn};

use crate::error::{Error, IoResultExt, Result};
use crate::transport::http::FileHeaders;

const PORT_RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// serves the files of one directory until stopped
///
/// dropping the handle stops the server.
pub struct ContentServer {
    server: Option<Arc<Server>>,
    thread: Option<JoinHandle<()>>,
    addr: SocketAddr,
}

impl ContentServer {
    /// bind `host:port` (port 0 picks one) and serve `root` on a background thread
    pub fn start(root: &Path, host: &str, port: u16) -> Result<Self> {
        let bind = format!("{}:{}", host, port);
        let failed = |message: String| Error::ContentServer {
            addr: bind.clone(),
            message,
        };
        if !root.is_dir() {
            return Err(failed(format!("{} is not a directory", root.display())));
        }

        let server = Server::http(bind.as_str()).map_err(|e| failed(e.to_string()))?;
        let addr = server
            .server_addr()
            .to_ip()
            .ok_or_else(|| failed("not listening on an ip socket".to_string()))?;
        let server = Arc::new(server);

        let root = root.to_path_buf();
        let worker = Arc::clone(&server);
        let thread = thread::Builder::new()
            .name("rootdeploy-serve".to_string())
            .spawn(move || serve_loop(&worker, &root))
            .map_err(|e| failed(e.to_string()))?;

        info!(addr = %addr, "content server started");
        Ok(Self {
            server: Some(server),
            thread: Some(thread),
            addr,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// stop serving and wait for the port to be free again
    pub fn stop(&mut self) {
        let Some(server) = self.server.take() else {
            return;
        };
        server.unblock();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(addr = %self.addr, "content server thread panicked");
            }
        }
        // last handle: dropping it closes the listener
        drop(server);
        wait_for_release(self.addr);
        info!(addr = %self.addr, "content server stopped");
    }
}

impl Drop for ContentServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn wait_for_release(addr: SocketAddr) {
    let deadline = Instant::now() + PORT_RELEASE_TIMEOUT;
    while TcpListener::bind(addr).is_err() {
        if Instant::now() >= deadline {
            warn!(addr = %addr, "port still in use after stop");
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
}

fn serve_loop(server: &Server, root: &Path) {
    loop {
        let request = match server.recv() {
            Ok(request) => request,
            // unblock() lands here
            Err(_) => break,
        };
        respond(request, root);
    }
}

fn respond(request: Request, root: &Path) {
    let method = request.method().clone();
    let url = request.url().to_string();

    let result = match method {
        Method::Get | Method::Head => match resolve_path(root, &url) {
            Some(path) => match file_response(&path) {
                Ok(response) => {
                    debug!(method = %method, url = %url, "serving");
                    request.respond(response)
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "cannot serve file");
                    request.respond(Response::empty(500))
                }
            },
            None => {
                debug!(method = %method, url = %url, "not found");
                request.respond(Response::empty(404))
            }
        },
        _ => request.respond(Response::empty(405)),
    };
    if let Err(e) = result {
        warn!(url = %url, error = %e, "failed to send response");
    }
}

/// the file's content plus its owner, mode and xattrs as headers
fn file_response(path: &Path) -> Result<Response<File>> {
    let headers = FileHeaders::read(path)?;
    let file = File::open(path).with_path(path)?;
    let mut response = Response::from_file(file);
    for (name, value) in headers.to_pairs()? {
        let header = Header::from_bytes(name.as_bytes(), value.as_bytes()).map_err(|_| {
            Error::Precondition(format!("unrepresentable {} header for {}", name, path.display()))
        })?;
        response.add_header(header);
    }
    Ok(response)
}

/// the regular file `url` names under `root`, if any
///
/// `..` anywhere rejects the request.
fn resolve_path(root: &Path, url: &str) -> Option<PathBuf> {
    let path = url.split(['?', '#']).next().unwrap_or("");
    let mut resolved = root.to_path_buf();
    for component in Path::new(path.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    let meta = std::fs::symlink_metadata(&resolved).ok()?;
    meta.is_file().then_some(resolved)
}
