// examples/check_server.rs
//
// POST /submissions/:id/verify queues a submission, GET /submissions/:id polls it.
//
//   curl -X POST localhost:7072/submissions/1/verify
//   curl localhost:7072/submissions/1
use lectern_core::{Routes, Server, ServerConfig, init_logging, syscalls};
use lectern_sandbox::{
    Check, Lesson, MemoryStore, ProgrammingStep, SandboxConfig, Status, Step, Submission,
    SubmittedStep, VerificationQueue, Verifier,
};
use std::sync::Arc;

fn seed(store: &MemoryStore) {
    store.insert_lesson(Lesson {
        id: 1,
        name: "echo".into(),
        steps: vec![Step::Programming(ProgrammingStep {
            name: "bbb for aaa".into(),
            description: "Print bbb when the input is aaa, ddd otherwise.".into(),
            examples: vec![Check::new("aaa", "bbb")],
            tests: vec![Check::new("aaa", "bbb"), Check::new("ccc", "ddd")],
        })],
    });
    store.insert_submission(Submission {
        id: 1,
        user_id: 1,
        lesson_id: 1,
        status: Status::Pending,
        steps: vec![SubmittedStep::programming(
            "python3",
            "print('bbb' if input() == 'aaa' else 'ddd')\n",
        )],
    });
}

fn routes(store: Arc<MemoryStore>, queue: Arc<VerificationQueue>) -> Routes {
    let mut routes = Routes::new();

    let records = store.clone();
    routes.get("/submissions/:id", move |_, params, res| {
        let found = params
            .get("id")
            .and_then(|id| id.parse().ok())
            .and_then(|id| records.submission(id));
        match found.map(|s| serde_json::to_vec(&s)) {
            Some(Ok(json)) => {
                res.content_type("application/json").body(&json);
            }
            Some(Err(_)) => {
                res.set_status(500).text("Internal Server Error");
            }
            None => {
                res.set_status(404).text("Not Found");
            }
        }
    });

    let verifying = queue.clone();
    routes.post("/submissions/:id/verify", move |_, params, res| {
        let Some(id) = params.get("id").and_then(|id| id.parse().ok()) else {
            res.set_status(400).text("Bad Request");
            return;
        };
        let location = format!("/submissions/{}", id);
        match verifying.handle().and_then(|h| h.try_enqueue(id)) {
            Ok(()) => {
                res.redirect(&location);
            }
            Err(e) => {
                res.set_status(503).text(&e.to_string());
            }
        }
    });

    routes.post("/submissions/:id/recheck", move |_, params, res| {
        let Some(id) = params.get("id").and_then(|id| id.parse().ok()) else {
            res.set_status(400).text("Bad Request");
            return;
        };
        match queue.recheck(id) {
            Ok(()) => {
                res.redirect(&format!("/submissions/{}", id));
            }
            Err(e) => {
                res.set_status(404).text(&e.to_string());
            }
        }
    });

    routes
}

fn main() {
    init_logging();

    let config = ServerConfig::from_env();
    // Before the verifier thread exists, so it inherits the signal mask too.
    if config.handle_signals {
        if let Err(e) = syscalls::route_shutdown_signals() {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    }

    let verifier = match Verifier::from_config(SandboxConfig::from_env()) {
        Ok(v) => Arc::new(v),
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    };
    let store = Arc::new(MemoryStore::new());
    seed(&store);
    let queue = match VerificationQueue::start(verifier, store.clone()) {
        Ok(q) => Arc::new(q),
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    };

    let server = match Server::bind(config) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = server.serve(routes(store, queue)) {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}
