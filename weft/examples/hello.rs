// examples/hello.rs
use weft::{Pattern, Response, Router, Server, SseEvent};

fn main() {
    weft::init_logging();

    let mut router = Router::new();

    router.get::<(), _, _>(Pattern::literal("/hello"), |_req, ()| async {
        Ok(Response::ok("Hello, World!\n"))
    });

    router.get::<(String,), _, _>(
        Pattern::root().lit("hello").string(),
        |req: weft::Request, (name,)| {
            let agent = req
                .header("User-Agent")
                .unwrap_or("Unknown")
                .to_string();
            async move {
                Ok(Response::ok(format!(
                    "Hello, {}! You are using {}.\n",
                    name, agent
                )))
            }
        },
    );

    router.get::<(i64,), _, _>(
        Pattern::root().lit("count").int(),
        |_req, (n,)| async move {
            let chunks = (0..n).map(|i| format!("chunk {}\n", i).into_bytes());
            Ok(Response::stream(chunks))
        },
    );

    router.get::<(), _, _>(Pattern::literal("/events"), |_req, ()| async {
        let events = (0..5).map(|i| SseEvent::new(format!("tick {}", i)).id(i.to_string()));
        Ok(weft::sse_response(events))
    });

    Server::bind("0.0.0.0:8082")
        .workers(2)
        .serve(router)
        .unwrap();
}
