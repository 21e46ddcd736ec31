use std::fmt::Write as _;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, info};

use weaver_core::config::TeamConfig;
use weaver_core::error::Result;
use weaver_core::traits::{
    AgentTeamProvider, Contribution, Participant, SamplingProvider, SamplingRequest, TeamRequest,
    Transcript,
};

/// Agent team built on a single sampler.
///
/// Participants speak in declaration order, once per round. Each one is
/// shown the task and every contribution made so far, including earlier
/// speakers in the current round. A contribution containing the consensus
/// marker ends the session immediately.
pub struct TurnTakingTeam {
    sampler: Arc<dyn SamplingProvider>,
    config: TeamConfig,
}

impl TurnTakingTeam {
    pub fn new(sampler: Arc<dyn SamplingProvider>, config: TeamConfig) -> Self {
        Self { sampler, config }
    }

    fn build_prompt(
        &self,
        task: &str,
        participant: &Participant,
        round: usize,
        transcript: &[Contribution],
    ) -> String {
        let mut prompt = String::new();
        prompt.push_str("## Task\n\n");
        prompt.push_str(task);
        prompt.push_str("\n\n");

        if !transcript.is_empty() {
            prompt.push_str("## Discussion so far\n\n");
            for c in transcript {
                let _ = writeln!(
                    prompt,
                    "[round {}] {} ({}): {}",
                    c.round, c.participant_id, c.role, c.contribution
                );
            }
            prompt.push('\n');
        }

        let _ = write!(
            prompt,
            "You are {}, acting as {}. This is round {}. Add your contribution. \
             If the team has reached agreement, include {} in your reply.",
            participant.id, participant.role, round, self.config.consensus_marker
        );
        prompt
    }
}

impl AgentTeamProvider for TurnTakingTeam {
    fn run_rounds(&self, request: TeamRequest) -> BoxFuture<'_, Result<Transcript>> {
        Box::pin(async move {
            let mut transcript = Transcript::default();
            if request.participants.is_empty() {
                return Ok(transcript);
            }

            for round in 1..=request.max_rounds {
                transcript.rounds = round;
                for participant in &request.participants {
                    let prompt = self.build_prompt(
                        &request.prompt,
                        participant,
                        round,
                        &transcript.contributions,
                    );
                    let mut sample = SamplingRequest::new(prompt, request.config.clone());
                    if let Some(system) = &participant.system {
                        sample = sample.with_system(system.clone());
                    }

                    let response = self.sampler.sample(sample).await?;
                    debug!(
                        round,
                        participant = %participant.id,
                        chars = response.text.len(),
                        "Team contribution"
                    );

                    let agreed = response.text.contains(&self.config.consensus_marker);
                    transcript.contributions.push(Contribution {
                        round,
                        participant_id: participant.id.clone(),
                        role: participant.role.clone(),
                        contribution: response.text,
                    });

                    if agreed {
                        info!(round, participant = %participant.id, "Team reached consensus");
                        transcript.consensus = true;
                        return Ok(transcript);
                    }
                }
            }

            Ok(transcript)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weaver_core::config::SamplingConfig;
    use weaver_test_utils::ScriptedSampler;

    fn request(max_rounds: usize) -> TeamRequest {
        let mut critic = Participant::new("critic", "reviewer");
        critic.system = Some("You are the critic".into());
        TeamRequest {
            participants: vec![Participant::new("writer", "author"), critic],
            prompt: "Name the project".into(),
            max_rounds,
            config: SamplingConfig::default(),
        }
    }

    #[tokio::test]
    async fn runs_all_rounds_without_consensus() {
        let sampler = Arc::new(
            ScriptedSampler::new()
                .reply("You are the critic", "too long")
                .reply("writer", "weaver"),
        );
        let team = TurnTakingTeam::new(sampler.clone(), TeamConfig::default());

        let transcript = team.run_rounds(request(2)).await.unwrap();
        assert_eq!(transcript.rounds, 2);
        assert!(!transcript.consensus);
        let speakers: Vec<_> = transcript
            .contributions
            .iter()
            .map(|c| (c.round, c.participant_id.as_str()))
            .collect();
        assert_eq!(speakers, vec![(1, "writer"), (1, "critic"), (2, "writer"), (2, "critic")]);

        // The critic sees the writer's same-round contribution.
        let prompts = sampler.prompts();
        assert!(prompts[1].contains("[round 1] writer (author): weaver"));
        assert!(!prompts[0].contains("Discussion so far"));
    }

    #[tokio::test]
    async fn consensus_marker_stops_early() {
        let sampler = Arc::new(
            ScriptedSampler::new()
                .reply("You are the critic", "agreed [CONSENSUS]")
                .reply("writer", "weaver"),
        );
        let team = TurnTakingTeam::new(sampler.clone(), TeamConfig::default());

        let transcript = team.run_rounds(request(5)).await.unwrap();
        assert!(transcript.consensus);
        assert_eq!(transcript.rounds, 1);
        assert_eq!(transcript.contributions.len(), 2);
        assert_eq!(sampler.requests().len(), 2);
    }

    #[tokio::test]
    async fn provider_error_propagates() {
        let sampler = Arc::new(ScriptedSampler::new().fail("writer", "rate limited"));
        let team = TurnTakingTeam::new(sampler, TeamConfig::default());
        assert!(team.run_rounds(request(1)).await.is_err());
    }
}
