use termchat_core::{ChatHistory, Role};
use termchat_llm::{
    token_channel, Backend, GenerationController, GenerationRequest, Manifest, ModelAdapter, TickOutcome,
    TokenEvent, TokenFilter,
};

fn usage_and_exit() -> ! {
    eprintln!(
        "termchat_smoke [--backend mock|llama] [--manifest <path>] [--model <path>] [--prompt <text>] [--cancel-after-chunks <n>]\n\n  --backend              Backend to use (default: mock).\n  --manifest             Manifest path (default: termchat.toml, optional).\n  --model                Model path, overrides the manifest.\n  --prompt               User prompt (default: 'Hello!').\n  --cancel-after-chunks  Request cancellation after N streamed chunks (optional)."
    );
    std::process::exit(2)
}

fn main() {
    // Drives one turn end to end:
    // - load the model
    // - tick the controller until it stops
    // - demonstrate cancellation if requested
    let mut backend_choice = "mock".to_string();
    let mut manifest_path = "termchat.toml".to_string();
    let mut model_override: Option<String> = None;
    let mut prompt = "Hello!".to_string();
    let mut cancel_after_chunks: Option<u32> = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => usage_and_exit(),
            "--backend" => {
                backend_choice = args.next().unwrap_or_else(|| usage_and_exit());
            }
            "--manifest" => {
                manifest_path = args.next().unwrap_or_else(|| usage_and_exit());
            }
            "--model" => {
                model_override = Some(args.next().unwrap_or_else(|| usage_and_exit()));
            }
            "--prompt" => {
                prompt = args.next().unwrap_or_else(|| usage_and_exit());
            }
            "--cancel-after-chunks" => {
                let raw = args.next().unwrap_or_else(|| usage_and_exit());
                cancel_after_chunks = Some(raw.parse().unwrap_or_else(|_| usage_and_exit()));
            }
            other => {
                eprintln!("unknown arg: {other}");
                usage_and_exit();
            }
        }
    }

    let manifest = match Manifest::load_or_default(&manifest_path) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("failed to read manifest {manifest_path}: {e}");
            std::process::exit(1);
        }
    };
    let backend = match Backend::from_name(&backend_choice) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let mut adapter = ModelAdapter::new(backend, manifest.runtime.clone(), manifest.sampling.clone());
    let model_path = model_override.map(Into::into).unwrap_or_else(|| manifest.model_path());
    if let Err(e) = adapter.load(&model_path) {
        eprintln!("failed to load {}: {e}", model_path.display());
        std::process::exit(1);
    }
    eprintln!("[status] {}", adapter.status());

    let generation = &manifest.generation;
    let mut history = ChatHistory::new()
        .with_template(generation.template)
        .with_window(generation.history_window);
    if let Some(system) = &generation.system_prompt {
        history.set_system_prompt(system.clone());
    }
    history.append(Role::User, prompt);

    let mut controller = GenerationController::new(TokenFilter::new(generation.stop_markers()));
    let (sink, stream) = token_channel();
    let request = GenerationRequest::new(history.build_prompt(), generation.max_tokens, sink);
    if let Err(e) = controller.start(request) {
        eprintln!("failed to start generation: {e}");
        std::process::exit(1);
    }
    let cancel = controller.cancel_handle();

    let mut seen_chunks: u32 = 0;
    let mut cancel_at = cancel_after_chunks;
    loop {
        let outcome = controller.tick(&mut adapter);
        for ev in stream.drain() {
            match ev {
                TokenEvent::Fragment { text, .. } => {
                    print!("{text}");
                    seen_chunks += 1;
                    if cancel_at.is_some_and(|n| seen_chunks >= n) {
                        cancel.request();
                        eprintln!("\n[cancel requested after {seen_chunks} chunks]");
                        cancel_at = None;
                    }
                }
                TokenEvent::Finished(summary) => {
                    eprintln!(
                        "\n\n[finished] reason={} prompt_tokens={} emitted={}",
                        summary.reason, summary.prompt_tokens, summary.emitted_tokens
                    );
                }
            }
        }
        if !matches!(outcome, TickOutcome::Pending) {
            break;
        }
    }
}
