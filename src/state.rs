//! Wiring: one `AppState` shared by the router and the schedulers.

use std::path::PathBuf;
use std::sync::Arc;

use sqlx::PgPool;

use crate::config::Config;
use crate::db::PgStore;
use crate::integrations::amocrm::{AmoCrm, FileTokenStore};
use crate::integrations::cdek::Cdek;
use crate::integrations::collaborators::{ChatModerator, TelegramModerator, Unavailable};
use crate::integrations::yandex::Yandex;
use crate::integrations::yookassa::YooKassa;
use crate::integrations::UpstreamError;
use crate::orders::{OrderEngine, OrderSettings};
use crate::promo::{PromoImporter, WebDavSheet};
use crate::rpc::RpcService;
use crate::sync::feed::ODataFeed;
use crate::sync::CatalogSync;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: PgStore,
    pub orders: Arc<OrderEngine>,
    pub cdek: Arc<Cdek>,
    pub yandex: Arc<Yandex>,
    pub amocrm: Arc<AmoCrm>,
    pub rpc: RpcService,
    pub catalog_sync: Arc<CatalogSync>,
    pub promo_import: Arc<PromoImporter>,
    pub moderator: Arc<dyn ChatModerator>,
}

impl AppState {
    /// Builds every adapter from config. Adapters without credentials are
    /// built anyway and fail their calls with a configuration error.
    pub fn build(config: Config, pool: PgPool) -> Result<Self, UpstreamError> {
        let store = PgStore::new(pool);
        let shared = Arc::new(store.clone());

        let cdek = Arc::new(Cdek::new(&config.cdek)?);
        let yandex = Arc::new(Yandex::new(&config.yandex)?);
        let amocrm = Arc::new(AmoCrm::new(
            &config.amocrm,
            Arc::new(FileTokenStore::new(PathBuf::from(&config.amocrm.token_file))),
            Arc::new(Unavailable("amocrm_login")),
            Arc::new(Unavailable("smtp")),
        )?);
        let payments = Arc::new(YooKassa::new(&config.yookassa)?);

        let orders = Arc::new(OrderEngine::new(
            shared.clone(),
            payments,
            amocrm.clone(),
            cdek.clone(),
            OrderSettings { return_url: config.yookassa.return_url.clone() },
        ));
        let catalog_sync = Arc::new(CatalogSync::new(Arc::new(ODataFeed::new(&config.enterprise)?), shared.clone()));
        let promo_import = Arc::new(PromoImporter::new(Arc::new(WebDavSheet::new(&config.promo_sheet)?), shared));
        let moderator: Arc<dyn ChatModerator> = Arc::new(TelegramModerator::new(config.bots.antispam_bot_token.clone())?);
        let rpc = RpcService::new(store.clone(), config.bots.premium_days_per_order);

        Ok(Self {
            config: Arc::new(config),
            store,
            orders,
            cdek,
            yandex,
            amocrm,
            rpc,
            catalog_sync,
            promo_import,
            moderator,
        })
    }
}
