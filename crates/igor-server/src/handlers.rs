use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use igor_core::constants::DIAMETER_SUCCESS;
use igor_core::Result;
use igor_dict::DiameterDictionary;
use igor_diameter::DiameterMessage;
use igor_peer::DiameterHandler;
use igor_radius::RadiusPacket;
use igor_radius_engine::RadiusHandler;

/// The most basic handler ever: returns an empty success answer to the
/// received message
pub struct EmptyDiameterHandler {
    pub dict: Arc<DiameterDictionary>,
    pub origin_host: String,
    pub origin_realm: String,
}

#[async_trait]
impl DiameterHandler for EmptyDiameterHandler {
    async fn handle(&self, request: DiameterMessage) -> Result<DiameterMessage> {
        info!(request = %request, "handling diameter request");

        let mut answer = DiameterMessage::new_answer(&request);
        answer.add_origin_avps(&self.origin_host, &self.origin_realm, &self.dict)?;
        answer.add("Result-Code", DIAMETER_SUCCESS, &self.dict)?;
        Ok(answer)
    }
}

/// The most basic handler ever: accepts every request
pub struct EmptyRadiusHandler;

#[async_trait]
impl RadiusHandler for EmptyRadiusHandler {
    async fn handle(&self, request: RadiusPacket) -> Result<RadiusPacket> {
        info!(request = %request, "handling radius request");

        Ok(RadiusPacket::new_response(&request, true))
    }
}
