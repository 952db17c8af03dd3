//! Eventos del Deep Advisor y su proyección en un estado plano por turno.
//!
//! El backend emite una línea `data: {json}` por evento con un discriminante
//! `event`. Cada evento se aplica en orden de llegada sobre `StreamState`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::sse::{data_payload, SseLineBuffer};

/// Marca que se añade a la respuesta cuando el usuario detiene el flujo.
pub const STOPPED_BY_USER_MARKER: &str = "\n\n*[Respuesta detenida por el usuario]*";

const DEFAULT_ERROR_MESSAGE: &str = "Error desconocido del asesor";

/// Fase final de un flujo completado.
pub const PHASE_COMPLETE: &str = "complete";
pub const PHASE_ERROR: &str = "error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Running,
    Completed,
    Failed,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub snippet: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedFact {
    #[serde(default, alias = "text", alias = "content")]
    pub fact: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// Evento recibido en el flujo. Los tipos desconocidos se ignoran.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AdvisorEvent {
    Session {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        chat_id: Option<String>,
    },
    Phase {
        #[serde(default)]
        phase: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
    Context {
        #[serde(rename = "type")]
        source_type: String,
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        count: Option<u64>,
        #[serde(default)]
        message: Option<String>,
    },
    Agents {
        #[serde(default)]
        agents: Vec<String>,
    },
    Agent {
        agent: String,
        status: AgentStatus,
        #[serde(default)]
        message: Option<String>,
    },
    Synthesis {
        #[serde(default)]
        chunk: String,
    },
    Complete {
        #[serde(default)]
        sources: Vec<Source>,
        #[serde(default)]
        domain_scores: BTreeMap<String, f64>,
        #[serde(default, alias = "facts_extracted")]
        facts: Vec<ExtractedFact>,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        code: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

impl AdvisorEvent {
    /// Interpreta la carga útil de una línea `data:`. El JSON mal formado se
    /// descarta.
    pub fn parse(payload: &str) -> Option<Self> {
        match serde_json::from_str::<AdvisorEvent>(payload) {
            Ok(AdvisorEvent::Unknown) => {
                debug!("Evento SSE de tipo desconocido ignorado: {}", payload);
                None
            }
            Ok(event) => Some(event),
            Err(e) => {
                debug!("Línea SSE no válida ignorada ({}): {}", e, payload);
                None
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextSource {
    pub source_type: String,
    pub status: Option<String>,
    pub count: Option<u64>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentProgress {
    pub name: String,
    pub status: AgentStatus,
    pub message: Option<String>,
}

/// Estado de un turno de chat. Se descarta al empezar el siguiente.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamState {
    pub session_id: Option<String>,
    pub chat_id: Option<String>,
    pub phase: Option<String>,
    pub phase_message: Option<String>,
    pub contexts: Vec<ContextSource>,
    pub agents: Vec<AgentProgress>,
    pub response: String,
    pub sources: Vec<Source>,
    pub domain_scores: BTreeMap<String, f64>,
    pub facts: Vec<ExtractedFact>,
    pub is_streaming: bool,
    pub error: Option<String>,
}

impl StreamState {
    /// Estado inicial de un turno que acaba de enviarse.
    pub fn streaming() -> Self {
        Self {
            is_streaming: true,
            ..Self::default()
        }
    }

    pub fn apply(&mut self, event: AdvisorEvent) {
        match event {
            AdvisorEvent::Session {
                session_id,
                chat_id,
            } => {
                self.session_id = session_id.or(self.session_id.take());
                self.chat_id = chat_id.or(self.chat_id.take());
            }
            AdvisorEvent::Phase { phase, message } => {
                if phase.is_some() {
                    self.phase = phase;
                }
                self.phase_message = message;
            }
            AdvisorEvent::Context {
                source_type,
                status,
                count,
                message,
            } => {
                let entry = ContextSource {
                    source_type,
                    status,
                    count,
                    message,
                };
                match self
                    .contexts
                    .iter_mut()
                    .find(|c| c.source_type == entry.source_type)
                {
                    Some(existing) => *existing = entry,
                    None => self.contexts.push(entry),
                }
            }
            AdvisorEvent::Agents { agents } => {
                self.agents = agents
                    .into_iter()
                    .map(|name| AgentProgress {
                        name,
                        status: AgentStatus::Pending,
                        message: None,
                    })
                    .collect();
            }
            AdvisorEvent::Agent {
                agent,
                status,
                message,
            } => match self.agents.iter_mut().find(|a| a.name == agent) {
                Some(existing) => {
                    existing.status = status;
                    existing.message = message;
                }
                None => self.agents.push(AgentProgress {
                    name: agent,
                    status,
                    message,
                }),
            },
            AdvisorEvent::Synthesis { chunk } => self.response.push_str(&chunk),
            AdvisorEvent::Complete {
                sources,
                domain_scores,
                facts,
            } => {
                self.phase = Some(PHASE_COMPLETE.to_string());
                self.sources = sources;
                self.domain_scores = domain_scores;
                self.facts = facts;
                self.is_streaming = false;
            }
            AdvisorEvent::Error { message, code } => {
                let message = message
                    .filter(|m| !m.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_ERROR_MESSAGE.to_string());
                self.error = Some(match code {
                    Some(code) => format!("{message} ({code})"),
                    None => message,
                });
                self.phase = Some(PHASE_ERROR.to_string());
                self.is_streaming = false;
            }
            AdvisorEvent::Unknown => {}
        }
    }

    /// El usuario ha detenido el flujo: no es un error.
    pub fn mark_stopped_by_user(&mut self) {
        self.response.push_str(STOPPED_BY_USER_MARKER);
        self.is_streaming = false;
    }

    /// Registra un fallo que no llegó como evento `error`.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
        self.phase = Some(PHASE_ERROR.to_string());
        self.is_streaming = false;
    }
}

/// Resultado de alimentar el reductor con un trozo del flujo.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FeedOutcome {
    pub events: usize,
    pub appended_text: bool,
}

/// Búfer de líneas más estado: recibe bytes y devuelve el estado proyectado.
#[derive(Debug, Default)]
pub struct AdvisorStreamReducer {
    buffer: SseLineBuffer,
    state: StreamState,
}

impl AdvisorStreamReducer {
    pub fn new(state: StreamState) -> Self {
        Self {
            buffer: SseLineBuffer::new(),
            state,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> FeedOutcome {
        let lines = self.buffer.push(chunk);
        let mut outcome = FeedOutcome::default();
        for line in lines {
            self.apply_line(&line, &mut outcome);
        }
        outcome
    }

    /// Procesa la línea final sin salto, si la hay.
    pub fn finish(&mut self) -> FeedOutcome {
        let mut outcome = FeedOutcome::default();
        if let Some(line) = self.buffer.finish() {
            self.apply_line(&line, &mut outcome);
        }
        outcome
    }

    fn apply_line(&mut self, line: &str, outcome: &mut FeedOutcome) {
        let Some(event) = data_payload(line).and_then(AdvisorEvent::parse) else {
            return;
        };
        if matches!(event, AdvisorEvent::Synthesis { .. }) {
            outcome.appended_text = true;
        }
        self.state.apply(event);
        outcome.events += 1;
    }

    pub fn state(&self) -> &StreamState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut StreamState {
        &mut self.state
    }

    pub fn into_state(self) -> StreamState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = concat!(
        "data: {\"event\":\"phase\",\"message\":\"x\"}\n",
        "data: {\"event\":\"synthesis\",\"chunk\":\"Hello \"}\n",
        "data: {\"event\":\"synthesis\",\"chunk\":\"world\"}\n",
        "data: {\"event\":\"complete\",\"sources\":[]}\n",
    );

    fn run(chunks: &[&[u8]]) -> StreamState {
        let mut reducer = AdvisorStreamReducer::new(StreamState::streaming());
        for chunk in chunks {
            reducer.feed(chunk);
        }
        reducer.finish();
        reducer.into_state()
    }

    #[test]
    fn test_phase_synthesis_complete_scenario() {
        let state = run(&[SCENARIO.as_bytes()]);
        assert_eq!(state.response, "Hello world");
        assert_eq!(state.phase.as_deref(), Some("complete"));
        assert_eq!(state.phase_message.as_deref(), Some("x"));
        assert!(!state.is_streaming);
        assert!(state.error.is_none());
    }

    #[test]
    fn test_result_is_independent_of_chunking() {
        let stream = format!(
            "{}{}{}",
            "data: {\"event\":\"session\",\"session_id\":\"s-1\",\"chat_id\":\"c-9\"}\n",
            "data: {\"event\":\"agents\",\"agents\":[\"técnico\",\"mercado\"]}\n",
            SCENARIO
        );
        let bytes = stream.as_bytes();
        let whole = run(&[bytes]);

        // Todas las particiones en dos trozos, incluidas las que cortan
        // caracteres multibyte.
        for split in 0..=bytes.len() {
            let (a, b) = bytes.split_at(split);
            assert_eq!(run(&[a, b]), whole, "corte en el byte {split}");
        }

        // Byte a byte.
        let singles: Vec<&[u8]> = bytes.chunks(1).collect();
        assert_eq!(run(&singles), whole);
    }

    #[test]
    fn test_error_event_stops_streaming() {
        let state = run(&[b"data: {\"event\":\"error\",\"message\":\"Fallo del agente\"}\n"]);
        assert!(!state.is_streaming);
        assert_eq!(state.error.as_deref(), Some("Fallo del agente"));
        assert_eq!(state.phase.as_deref(), Some("error"));
    }

    #[test]
    fn test_error_event_without_message_is_still_non_null() {
        let state = run(&[b"data: {\"event\":\"error\",\"code\":\"SSE_TIMEOUT\"}\n"]);
        assert!(!state.is_streaming);
        let error = state.error.unwrap();
        assert!(error.contains("SSE_TIMEOUT"));
    }

    #[test]
    fn test_agents_reset_roster_and_agent_updates() {
        let mut state = StreamState::streaming();
        state.apply(AdvisorEvent::Agents {
            agents: vec!["técnico".into(), "regulatorio".into()],
        });
        state.apply(AdvisorEvent::Agent {
            agent: "técnico".into(),
            status: AgentStatus::Running,
            message: Some("analizando".into()),
        });
        state.apply(AdvisorEvent::Agent {
            agent: "mercado".into(),
            status: AgentStatus::Completed,
            message: None,
        });

        assert_eq!(state.agents.len(), 3);
        assert_eq!(state.agents[0].status, AgentStatus::Running);
        assert_eq!(state.agents[1].status, AgentStatus::Pending);
        assert_eq!(state.agents[2].name, "mercado");

        state.apply(AdvisorEvent::Agents {
            agents: vec!["síntesis".into()],
        });
        assert_eq!(state.agents.len(), 1);
        assert_eq!(state.agents[0].status, AgentStatus::Pending);
    }

    #[test]
    fn test_context_is_upserted_by_type() {
        let state = run(&[
            "data: {\"event\":\"context\",\"type\":\"documents\",\"status\":\"loading\"}\n".as_bytes(),
            "data: {\"event\":\"context\",\"type\":\"technologies\",\"count\":12}\n".as_bytes(),
            "data: {\"event\":\"context\",\"type\":\"documents\",\"status\":\"done\",\"count\":4}\n".as_bytes(),
        ]);
        assert_eq!(state.contexts.len(), 2);
        assert_eq!(state.contexts[0].source_type, "documents");
        assert_eq!(state.contexts[0].status.as_deref(), Some("done"));
        assert_eq!(state.contexts[0].count, Some(4));
        assert_eq!(state.contexts[1].count, Some(12));
    }

    #[test]
    fn test_complete_carries_sources_scores_and_facts() {
        let state = run(&[concat!(
            "data: {\"event\":\"complete\",",
            "\"sources\":[{\"title\":\"Informe EDAR\",\"url\":\"https://ex.org\",\"type\":\"document\"}],",
            "\"domain_scores\":{\"tecnico\":0.8},",
            "\"facts_extracted\":[{\"text\":\"Caudal de 500 m3/d\"}]}\n"
        )
        .as_bytes()]);

        assert_eq!(state.sources.len(), 1);
        assert_eq!(state.sources[0].kind.as_deref(), Some("document"));
        assert_eq!(state.domain_scores.get("tecnico"), Some(&0.8));
        assert_eq!(state.facts[0].fact, "Caudal de 500 m3/d");
    }

    #[test]
    fn test_unknown_and_malformed_lines_are_ignored() {
        let mut reducer = AdvisorStreamReducer::new(StreamState::streaming());
        let outcome = reducer.feed(
            b"data: {\"event\":\"heartbeat\"}\ndata: {no-json\n: comentario\ndata: [DONE]\n",
        );
        assert_eq!(outcome.events, 0);
        assert_eq!(reducer.state(), &StreamState::streaming());
    }

    #[test]
    fn test_feed_reports_text_appends() {
        let mut reducer = AdvisorStreamReducer::new(StreamState::streaming());
        let outcome = reducer.feed(b"data: {\"event\":\"phase\",\"phase\":\"agents\"}\n");
        assert_eq!(outcome, FeedOutcome { events: 1, appended_text: false });
        let outcome = reducer.feed(b"data: {\"event\":\"synthesis\",\"chunk\":\"a\"}\n");
        assert!(outcome.appended_text);
        assert_eq!(reducer.state().phase.as_deref(), Some("agents"));
    }

    #[test]
    fn test_stopped_by_user_is_not_an_error() {
        let mut state = StreamState::streaming();
        state.apply(AdvisorEvent::Synthesis {
            chunk: "Respuesta parcial".into(),
        });
        state.mark_stopped_by_user();
        assert_eq!(
            state.response,
            format!("Respuesta parcial{STOPPED_BY_USER_MARKER}")
        );
        assert!(!state.is_streaming);
        assert!(state.error.is_none());
    }
}
