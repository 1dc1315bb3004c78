/// Payload tokenization logic
use crate::templates::TemplateFormatter;
use crate::RerankError;
use std::sync::Arc;
use tokenizers::tokenizer::Tokenizer;
use tokio::sync::oneshot;
use tracing::{instrument, Span};

static MAX_CHAR_MULTIPLIER: usize = 250;

type Template = Arc<dyn TemplateFormatter + Send + Sync>;

/// Validation
#[derive(Debug, Clone)]
pub struct Tokenization {
    /// Channel to communicate with the background tokenization task
    sender: async_channel::Sender<TokenizerRequest>,
}

impl Tokenization {
    pub fn new(
        workers: usize,
        mut tokenizer: Tokenizer,
        max_input_length: usize,
        template: Template,
    ) -> Result<Self, RerankError> {
        tracing::info!("Starting {workers} tokenization workers");

        tokenizer.with_truncation(None)?;
        tokenizer.with_padding(None);

        // The prompt frame is identical for every document
        let prefix_ids = tokenizer.encode(template.prefix(), false)?.get_ids().to_vec();
        let suffix_ids = tokenizer.encode(template.suffix(), false)?.get_ids().to_vec();

        let frame_length = prefix_ids.len() + suffix_ids.len();
        if frame_length >= max_input_length {
            return Err(RerankError::Validation(format!(
                "the prompt template alone takes {frame_length} tokens, more than the maximum input length {max_input_length}"
            )));
        }

        let frame = Arc::new(PromptFrame {
            template,
            prefix_ids,
            suffix_ids,
            max_input_length,
        });

        // Create channel
        let (sender, receiver) = async_channel::bounded(workers * 4);

        // Create workers
        for _ in 0..workers {
            let tokenizer_clone = tokenizer.clone();
            let receiver_clone = receiver.clone();
            let frame_clone = frame.clone();
            // Spawn worker
            std::thread::spawn(move || tokenizer_worker(tokenizer_clone, frame_clone, receiver_clone));
        }

        Ok(Self { sender })
    }

    #[instrument(skip_all)]
    pub async fn encode(
        &self,
        query: String,
        document: String,
        instruction: Option<String>,
        truncate: bool,
    ) -> Result<ValidEncoding, RerankError> {
        // Create response channel
        let (response_sender, response_receiver) = oneshot::channel();
        // Send request to the background validation task
        // Unwrap is safe here
        self.sender
            .send(TokenizerRequest::Encode(
                RerankInput {
                    query,
                    document,
                    instruction,
                },
                truncate,
                response_sender,
                Span::current(),
            ))
            .await
            .expect("Tokenization background task dropped the receiver. This is a bug.");

        // Await on response channel
        // Unwrap is safe here
        response_receiver.await.expect("Tokenization background task dropped the sender without sending a response. This is a bug.")
    }
}

/// Token ids of the fixed part of the prompt
struct PromptFrame {
    template: Template,
    prefix_ids: Vec<u32>,
    suffix_ids: Vec<u32>,
    max_input_length: usize,
}

/// Start tokenization workers
fn tokenizer_worker(
    tokenizer: Tokenizer,
    frame: Arc<PromptFrame>,
    receiver: async_channel::Receiver<TokenizerRequest>,
) {
    // Loop over requests
    while let Ok(request) = receiver.recv_blocking() {
        match request {
            TokenizerRequest::Encode(input, truncate, response_tx, parent_span) => {
                parent_span.in_scope(|| {
                    if !response_tx.is_closed() {
                        // It's possible that the user dropped its request resulting in a send error.
                        // We just discard the error
                        let _ = response_tx.send(encode_input(input, truncate, &frame, &tokenizer));
                    }
                })
            }
        }
    }
}

/// Template, tokenize and frame one (query, document) pair
fn encode_input(
    input: RerankInput,
    truncate: bool,
    frame: &PromptFrame,
    tokenizer: &Tokenizer,
) -> Result<ValidEncoding, RerankError> {
    let mut text = frame.template.format_rerank(
        &input.query,
        &input.document,
        input.instruction.as_deref(),
    );

    let input_chars = text.chars().count();
    let limit = frame.max_input_length * MAX_CHAR_MULTIPLIER;
    if input_chars > limit {
        if !truncate {
            return Err(RerankError::Validation(format!(
                "`inputs` must have less than {limit} characters. Given: {input_chars}"
            )));
        }
        truncate_chars(&mut text, limit);
    }

    let encoding = tokenizer.encode::<&str>(&text, false)?;
    let input_ids = frame_ids(
        &frame.prefix_ids,
        encoding.get_ids(),
        &frame.suffix_ids,
        frame.max_input_length,
        truncate,
    )?;

    let seq_len = input_ids.len();
    let histogram = metrics::histogram!("te_request_input_length");
    histogram.record(seq_len as f64);

    Ok(ValidEncoding {
        input_ids,
        position_ids: (0..seq_len as u32).collect(),
    })
}

/// `prefix + middle + suffix`, cutting `middle` on the right when it does not fit and
/// `truncate` is set
fn frame_ids(
    prefix: &[u32],
    middle: &[u32],
    suffix: &[u32],
    max_input_length: usize,
    truncate: bool,
) -> Result<Vec<u32>, RerankError> {
    let seq_len = prefix.len() + middle.len() + suffix.len();
    let middle = if seq_len > max_input_length {
        if !truncate {
            return Err(RerankError::Validation(format!(
                "`inputs` must have less than {max_input_length} tokens. Given: {seq_len}"
            )));
        }
        let budget = max_input_length.saturating_sub(prefix.len() + suffix.len());
        &middle[..budget]
    } else {
        middle
    };

    let mut ids = Vec::with_capacity(prefix.len() + middle.len() + suffix.len());
    ids.extend_from_slice(prefix);
    ids.extend_from_slice(middle);
    ids.extend_from_slice(suffix);
    Ok(ids)
}

fn truncate_chars(s: &mut String, limit: usize) {
    if let Some((index, _)) = s.char_indices().nth(limit) {
        s.truncate(index);
    }
}

#[derive(Debug)]
pub struct ValidEncoding {
    pub input_ids: Vec<u32>,
    pub position_ids: Vec<u32>,
}

#[derive(Debug)]
struct RerankInput {
    query: String,
    document: String,
    instruction: Option<String>,
}

enum TokenizerRequest {
    Encode(
        RerankInput,
        bool,
        oneshot::Sender<Result<ValidEncoding, RerankError>>,
        Span,
    ),
}

impl std::fmt::Debug for TokenizerRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenizerRequest::Encode(input, truncate, ..) => f
                .debug_struct("Encode")
                .field("input", input)
                .field("truncate", truncate)
                .finish(),
        }
    }
}
