// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Serve an update repository directory read-only over HTTP.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::fs::{self, File};
use std::path::{Component, Path, PathBuf};

use log::{debug, warn};
use percent_encoding::percent_decode_str;
use tiny_http::{Header, Method, Request, Response, Server};

use crate::error::{HarnessError, HarnessResult};

/// Minimal static file server for an update repository.
pub struct RepoServer {
    server: Server,
    root: PathBuf,
}

impl RepoServer {
    /// Bind to `addr` (for example `127.0.0.1:8000`) and serve `root`.
    pub fn bind(addr: &str, root: &Path) -> HarnessResult<Self> {
        if !root.is_dir() {
            return Err(HarnessError::Config(format!(
                "repository root {} is not a directory",
                root.display()
            )));
        }
        let server = Server::http(addr)
            .map_err(|err| HarnessError::Config(format!("bind {addr}: {err}")))?;
        Ok(Self {
            server,
            root: root.to_path_buf(),
        })
    }

    /// Port the server is listening on.
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.server.server_addr().to_ip().map(|addr| addr.port())
    }

    /// Answer requests until the listener fails.
    pub fn serve_forever(&self) {
        for request in self.server.incoming_requests() {
            self.handle(request);
        }
    }

    fn handle(&self, request: Request) {
        let method = request.method().clone();
        let url = request.url().to_owned();
        let result = match method {
            Method::Get | Method::Head => self.respond_file(request, &url),
            _ => request.respond(Response::from_string("method not allowed").with_status_code(405)),
        };
        if let Err(err) = result {
            warn!("{method} {url}: {err}");
        }
    }

    fn respond_file(&self, request: Request, url: &str) -> std::io::Result<()> {
        let Some(path) = resolve(&self.root, url) else {
            debug!("rejected {url}");
            return request.respond(Response::from_string("forbidden").with_status_code(403));
        };
        if path.is_dir() {
            let listing = list_dir(&path)?;
            return request.respond(Response::from_string(listing));
        }
        match File::open(&path) {
            Ok(file) => {
                debug!("serving {}", path.display());
                let mut response = Response::from_file(file);
                if let Ok(header) =
                    Header::from_bytes(&b"Content-Type"[..], &b"application/octet-stream"[..])
                {
                    response = response.with_header(header);
                }
                request.respond(response)
            }
            Err(_) => request.respond(Response::from_string("not found").with_status_code(404)),
        }
    }
}

/// Map a request URL onto a path under `root`; `None` if it would escape
/// or does not decode to UTF-8.
///
/// Percent escapes are decoded before the traversal check, so `%2e%2e`
/// is rejected like `..`.
#[must_use]
pub fn resolve(root: &Path, url: &str) -> Option<PathBuf> {
    let raw = url.split(['?', '#']).next().unwrap_or_default();
    let path = percent_decode_str(raw).decode_utf8().ok()?;
    if path.contains('\0') {
        return None;
    }
    let mut resolved = root.to_path_buf();
    for component in Path::new(path.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(resolved)
}

fn list_dir(path: &Path) -> std::io::Result<String> {
    let mut names: Vec<String> = fs::read_dir(path)?
        .filter_map(Result::ok)
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    let mut out = names.join("\n");
    out.push('\n');
    Ok(out)
}
