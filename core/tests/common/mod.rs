use std::path::Path;

use sidewinder_core::app::RequestContext;

/// Writes a Python module fixture into the working directory.
pub fn write_fixture(working_dir: &Path, module: &str, source: &str) {
    std::fs::write(working_dir.join(format!("{module}.py")), source.trim_start())
        .expect("fixture module should be writable");
}

pub fn request_context() -> RequestContext {
    RequestContext {
        client_addr: "127.0.0.1:52000".parse().unwrap(),
        server_addr: "127.0.0.1:9080".parse().unwrap(),
        tls: false,
    }
}
