use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose, Engine as _};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::storage::KeyValueStore;

/// Ключ, под которым хранится зашифрованный refresh token
const REFRESH_TOKEN_KEY: &str = "auth_refresh_token";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("not authenticated: {0}")]
    NotAuthenticated(String),
    #[error("network error during {context}: {message}")]
    Network { context: String, message: String },
    #[error("{context} failed with status {status}")]
    Rejected { context: String, status: u16 },
    #[error("failed to parse {context} response: {message}")]
    Decode { context: String, message: String },
    #[error("encryption: {0}")]
    Encryption(String),
}

/// Токены после login / refresh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Менеджер аутентификации: JWT access token в памяти, ротируемый refresh token
/// (в памяти и, если задано хранилище, зашифрованным в KeyValueStore)
pub struct AuthManager {
    api_base_url: String,
    client: reqwest::Client,
    pub access_token: Arc<tokio::sync::RwLock<Option<String>>>,
    pub refresh_token: Arc<tokio::sync::RwLock<Option<String>>>,
    persistence: Option<(Arc<dyn KeyValueStore>, TokenEncryption)>,
}

impl AuthManager {
    pub fn new(api_base_url: String, client: reqwest::Client) -> Self {
        Self {
            api_base_url,
            client,
            access_token: Arc::new(tokio::sync::RwLock::new(None)),
            refresh_token: Arc::new(tokio::sync::RwLock::new(None)),
            persistence: None,
        }
    }

    /// Хранить refresh token между запусками (зашифрованным)
    pub fn with_persistence(mut self, store: Arc<dyn KeyValueStore>, encryption: TokenEncryption) -> Self {
        self.persistence = Some((store, encryption));
        self
    }

    /// Установить токены (login, refresh, тесты)
    pub async fn set_tokens(&self, access_token: Option<String>, refresh_token: Option<String>) {
        *self.access_token.write().await = access_token;
        if let Some(refresh) = &refresh_token {
            self.persist_refresh_token(refresh);
        }
        *self.refresh_token.write().await = refresh_token;
    }

    /// Получить access token
    pub async fn get_access_token(&self) -> Result<String, AuthError> {
        self.access_token.read().await.clone().ok_or_else(|| {
            AuthError::NotAuthenticated("access token not set, log in first".to_string())
        })
    }

    /// Получить refresh token
    pub async fn get_refresh_token(&self) -> Option<String> {
        self.refresh_token.read().await.clone()
    }

    /// Восстановить refresh token из хранилища (при старте). Ok(true) - токен найден.
    pub async fn restore(&self) -> Result<bool, AuthError> {
        let Some((store, encryption)) = &self.persistence else {
            return Ok(false);
        };
        let stored = store
            .get_item(REFRESH_TOKEN_KEY)
            .map_err(|e| AuthError::Encryption(format!("failed to read stored token: {}", e)))?;
        let Some(item) = stored else {
            return Ok(false);
        };
        match encryption.decrypt(&item.value) {
            Ok(token) => {
                *self.refresh_token.write().await = Some(token);
                info!("[AUTH] Refresh token restored from storage");
                Ok(true)
            }
            Err(e) => {
                // Ключ сменился или данные повреждены - требуем новый login
                warn!("[AUTH] Stored refresh token unreadable ({}), discarding", e);
                let _ = store.remove_item(REFRESH_TOKEN_KEY);
                Ok(false)
            }
        }
    }

    fn persist_refresh_token(&self, token: &str) {
        let Some((store, encryption)) = &self.persistence else {
            return;
        };
        match encryption.encrypt(token) {
            Ok(encrypted) => {
                if let Err(e) = store.set_item(REFRESH_TOKEN_KEY, &encrypted, None) {
                    warn!("[AUTH] Failed to persist refresh token: {}", e);
                }
            }
            Err(e) => warn!("[AUTH] Failed to encrypt refresh token: {}", e),
        }
    }

    /// Вход по email/password
    pub async fn login(&self, email: &str, password: &str) -> Result<AuthTokens, AuthError> {
        let url = format!("{}/auth/login", self.api_base_url);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "email": email,
                "password": password,
            }))
            .send()
            .await
            .map_err(|e| AuthError::Network {
                context: "login".to_string(),
                message: e.to_string(),
            })?;

        let tokens = Self::parse_token_response("login", response).await?;
        self.set_tokens(Some(tokens.access_token.clone()), tokens.refresh_token.clone())
            .await;
        info!("[AUTH] Logged in as {}", email);
        Ok(tokens)
    }

    /// Обновить access token через refresh token.
    /// Сервер ротирует refresh token: новый приходит в теле или в Set-Cookie.
    pub async fn refresh(&self) -> Result<AuthTokens, AuthError> {
        let refresh_token = self.get_refresh_token().await.ok_or_else(|| {
            AuthError::NotAuthenticated("no refresh token available".to_string())
        })?;

        let url = format!("{}/auth/refresh", self.api_base_url);
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::COOKIE, format!("refreshToken={}", refresh_token))
            .json(&serde_json::json!({ "refreshToken": refresh_token }))
            .send()
            .await
            .map_err(|e| AuthError::Network {
                context: "token refresh".to_string(),
                message: e.to_string(),
            })?;

        let mut tokens = Self::parse_token_response("token refresh", response).await?;
        // Если сервер не прислал новый refresh token - продолжаем со старым
        if tokens.refresh_token.is_none() {
            tokens.refresh_token = Some(refresh_token);
        }
        self.set_tokens(Some(tokens.access_token.clone()), tokens.refresh_token.clone())
            .await;
        info!("[AUTH] Access token refreshed");
        Ok(tokens)
    }

    /// Выход: очистить токены в памяти и в хранилище
    pub async fn logout(&self) {
        *self.access_token.write().await = None;
        *self.refresh_token.write().await = None;
        if let Some((store, _)) = &self.persistence {
            if let Err(e) = store.remove_item(REFRESH_TOKEN_KEY) {
                warn!("[AUTH] Failed to remove stored refresh token: {}", e);
            }
        }
    }

    async fn parse_token_response(
        context: &str,
        response: reqwest::Response,
    ) -> Result<AuthTokens, AuthError> {
        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::Rejected {
                context: context.to_string(),
                status: status.as_u16(),
            });
        }

        let cookie_token = refresh_token_from_cookies(response.headers());
        let body: TokenResponse = response.json().await.map_err(|e| AuthError::Decode {
            context: context.to_string(),
            message: e.to_string(),
        })?;

        Ok(AuthTokens {
            access_token: body.access_token,
            refresh_token: body.refresh_token.or(cookie_token),
        })
    }
}

/// Достать refreshToken из заголовков Set-Cookie
fn refresh_token_from_cookies(headers: &reqwest::header::HeaderMap) -> Option<String> {
    headers
        .get_all(reqwest::header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|cookie| cookie.split(';').next())
        .filter_map(|pair| pair.trim().strip_prefix("refreshToken="))
        .find(|token| !token.is_empty())
        .map(|token| token.to_string())
}

// ============================================
// TOKEN ENCRYPTION
// ============================================

/// Шифрование токенов перед сохранением в SQLite
/// Использует AES-256-GCM для шифрования
pub struct TokenEncryption {
    cipher: Aes256Gcm,
}

impl TokenEncryption {
    /// Создать экземпляр с hex-ключом (32 байта) или дефолтным ключом
    pub fn new(key_hex: Option<&str>) -> Result<Self, AuthError> {
        let key = match key_hex {
            Some(hex_key) => hex::decode(hex_key.trim())
                .map_err(|e| AuthError::Encryption(format!("invalid hex key: {}", e)))?,
            None => {
                warn!("[AUTH] TIMETRACK_ENCRYPTION_KEY not set, using built-in key");
                b"timetrack-default-key-32-bytes!!".to_vec()
            }
        };

        let key_array: [u8; 32] = key
            .try_into()
            .map_err(|_| AuthError::Encryption("encryption key must be 32 bytes".to_string()))?;

        let cipher = Aes256Gcm::new(&key_array.into());

        Ok(Self { cipher })
    }

    /// Зашифровать токен: base64(nonce + ciphertext)
    pub fn encrypt(&self, token: &str) -> Result<String, AuthError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, token.as_bytes())
            .map_err(|e| AuthError::Encryption(format!("encryption failed: {}", e)))?;

        let mut result = nonce.to_vec();
        result.extend_from_slice(&ciphertext);

        Ok(general_purpose::STANDARD.encode(&result))
    }

    /// Расшифровать токен
    pub fn decrypt(&self, encrypted: &str) -> Result<String, AuthError> {
        let data = general_purpose::STANDARD
            .decode(encrypted)
            .map_err(|e| AuthError::Encryption(format!("base64 decode failed: {}", e)))?;

        if data.len() < 12 {
            return Err(AuthError::Encryption(
                "invalid encrypted data length".to_string(),
            ));
        }

        // nonce (первые 12 байт) и ciphertext (остальное)
        let nonce = Nonce::from_slice(&data[..12]);
        let ciphertext = &data[12..];

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| AuthError::Encryption(format!("decryption failed: {}", e)))?;

        String::from_utf8(plaintext)
            .map_err(|e| AuthError::Encryption(format!("UTF-8 decode failed: {}", e)))
    }
}
