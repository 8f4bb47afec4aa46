// examples/static_server.rs
//
// Serve the current directory with uploads and listings enabled:
//
//   cargo run --example static_server
//   curl http://localhost:8080/files/
//   curl -T notes.txt http://localhost:8080/files/notes.txt

use weft::{DirBehavior, DirOptions, Router, Scope, Server, StaticDir};

fn main() {
    weft::init_logging();

    let mut router = Router::new();
    let dir = StaticDir::new(
        ".",
        DirOptions {
            dir_behavior: DirBehavior::IndexOrLists,
            upload: true,
            delete: true,
            max_upload_size: 64 * 1024 * 1024,
            ..Default::default()
        },
    );
    dir.mount(&mut router, "/files", Scope::any());

    Server::bind("0.0.0.0:8080").serve(router).unwrap();
}
