use crate::errors::ForgeError;
use crate::managers::orchestrator::Orchestrator;
use crate::services::config::PipelineConfig;
use crate::services::logger::Logger;
use crate::services::oracle::{OpenAiOracle, OracleSettings, SuggestionOracle};
use crate::services::planner::RequestPlanner;
use crate::services::prompt::{CredentialPrompt, DeclinePrompt, StdinCredentialPrompt};
use crate::services::retry::{RetryController, Sleeper, TokioSleeper};
use crate::services::security::VaultCipher;
use crate::services::transport::{HttpTransport, ReqwestTransport};
use crate::services::validation::RequestValidator;
use crate::services::vault::{CredentialVault, SecretBackend};
use crate::stores::FileSecretStore;
use crate::utils::paths::{resolve_vault_key_path, resolve_vault_path};
use std::sync::Arc;

pub struct Collaborators {
    pub backend: Arc<dyn SecretBackend>,
    pub oracle: Arc<dyn SuggestionOracle>,
    pub transport: Arc<dyn HttpTransport>,
    pub sleeper: Arc<dyn Sleeper>,
    pub prompt: Arc<dyn CredentialPrompt>,
}

pub struct App {
    pub logger: Logger,
    pub config: PipelineConfig,
    pub vault: Arc<CredentialVault>,
    pub orchestrator: Orchestrator,
}

impl App {
    pub fn initialize(config: PipelineConfig, interactive: bool) -> Result<Self, ForgeError> {
        let logger = Logger::new("apiforge");
        let backend = open_file_backend()?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());
        let oracle = Arc::new(OpenAiOracle::new(
            logger.clone(),
            OracleSettings {
                url: config.oracle_url.clone(),
                model: config.oracle_model.clone(),
                api_key,
                timeout_ms: config.oracle_timeout_ms,
            },
        )?);
        let prompt: Arc<dyn CredentialPrompt> = if interactive {
            Arc::new(StdinCredentialPrompt)
        } else {
            Arc::new(DeclinePrompt)
        };
        Self::assemble(
            logger,
            config,
            Collaborators {
                backend,
                oracle,
                transport: Arc::new(ReqwestTransport::new()?),
                sleeper: Arc::new(TokioSleeper),
                prompt,
            },
        )
    }

    pub fn assemble(
        logger: Logger,
        config: PipelineConfig,
        parts: Collaborators,
    ) -> Result<Self, ForgeError> {
        config.validate()?;
        let vault = Arc::new(CredentialVault::new(logger.clone(), parts.backend));
        let planner = RequestPlanner::new(logger.clone(), parts.oracle);
        let validator = RequestValidator::new(logger.clone(), vault.clone());
        let retry = RetryController::new(
            logger.clone(),
            parts.transport,
            parts.sleeper,
            config.retry_policy(),
        );
        let orchestrator = Orchestrator::new(
            logger.clone(),
            config.clone(),
            planner,
            validator,
            vault.clone(),
            retry,
            parts.prompt,
        );
        Ok(Self {
            logger,
            config,
            vault,
            orchestrator,
        })
    }
}

pub fn open_vault(logger: &Logger) -> Result<Arc<CredentialVault>, ForgeError> {
    Ok(Arc::new(CredentialVault::new(
        logger.clone(),
        open_file_backend()?,
    )))
}

fn open_file_backend() -> Result<Arc<dyn SecretBackend>, ForgeError> {
    let cipher = VaultCipher::load_or_create(&resolve_vault_key_path())?;
    Ok(Arc::new(FileSecretStore::open(resolve_vault_path(), cipher)?))
}
