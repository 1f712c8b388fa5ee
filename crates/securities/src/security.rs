use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use refsync_converter::{Record, RecordSchema};

/// Name of the provider block carrying securities rows.
pub const SECURITIES_BLOCK: &str = "securities";

/// One security as listed by the market-data provider.
///
/// `sec_id` is the natural key used by the store.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Security {
    pub provider_id: Option<i32>,
    pub sec_id: String,
    pub short_name: String,
    pub reg_number: String,
    pub name: String,
    pub isin: String,
    pub is_traded: Option<bool>,
    pub emitent_id: Option<i32>,
    pub emitent_title: String,
    pub emitent_inn: String,
    pub emitent_okpo: String,
    pub gos_reg: String,
    pub security_type: String,
    pub security_group: String,
    pub primary_board_id: String,
    pub market_price_board_id: String,
}

impl Security {
    /// Traded flag with "unknown" treated as not traded.
    pub fn traded(&self) -> bool {
        self.is_traded.unwrap_or(false)
    }
}

impl Record for Security {
    fn schema() -> &'static RecordSchema<Self> {
        static SCHEMA: OnceLock<RecordSchema<Security>> = OnceLock::new();
        SCHEMA.get_or_init(|| {
            RecordSchema::<Security>::new("Security")
                .int32("id", |r, v| r.provider_id = v)
                .text("secid", |r, v| r.sec_id = v)
                .text("shortname", |r, v| r.short_name = v)
                .text("regnumber", |r, v| r.reg_number = v)
                .text("name", |r, v| r.name = v)
                .text("isin", |r, v| r.isin = v)
                .flag("is_traded", |r, v| r.is_traded = v)
                .int32("emitent_id", |r, v| r.emitent_id = v)
                .text("emitent_title", |r, v| r.emitent_title = v)
                .text("emitent_inn", |r, v| r.emitent_inn = v)
                .text("emitent_okpo", |r, v| r.emitent_okpo = v)
                .text("gosreg", |r, v| r.gos_reg = v)
                .text("type", |r, v| r.security_type = v)
                .text("group", |r, v| r.security_group = v)
                .text("primary_boardid", |r, v| r.primary_board_id = v)
                .text("marketprice_boardid", |r, v| r.market_price_board_id = v)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refsync_converter::{ConvertError, TabularResponse, convert};
    use serde_json::json;

    fn iss_document() -> serde_json::Value {
        json!({
            "securities": {
                "metadata": {
                    "id": {"type": "int32"},
                    "secid": {"type": "string", "bytes": 51, "max_size": 0},
                    "shortname": {"type": "string"},
                    "isin": {"type": "string"},
                    "is_traded": {"type": "int32"},
                    "emitent_title": {"type": "string"},
                    "type": {"type": "string"},
                    "primary_boardid": {"type": "string"}
                },
                "columns": ["id", "secid", "shortname", "isin", "is_traded", "emitent_title", "type", "primary_boardid"],
                "data": [
                    [2642, "SBER", "Сбербанк", "RU0009029540", 1, "ПАО Сбербанк", "common_share", "TQBR"],
                    [5439, "OLD1", null, null, 0, null, "corporate_bond", null]
                ]
            }
        })
    }

    #[test]
    fn converts_provider_block_into_securities() {
        let response = TabularResponse::from_json_block(&iss_document(), SECURITIES_BLOCK).unwrap();
        let securities: Vec<Security> = convert(&response).unwrap();

        assert_eq!(securities.len(), 2);
        let sber = &securities[0];
        assert_eq!(sber.provider_id, Some(2642));
        assert_eq!(sber.sec_id, "SBER");
        assert_eq!(sber.isin, "RU0009029540");
        assert_eq!(sber.security_type, "common_share");
        assert!(sber.traded());

        let old = &securities[1];
        assert_eq!(old.short_name, "");
        assert_eq!(old.primary_board_id, "");
        assert_eq!(old.is_traded, Some(false));
    }

    #[test]
    fn new_provider_column_is_reported_as_drift() {
        let mut doc = iss_document();
        doc["securities"]["columns"]
            .as_array_mut()
            .unwrap()
            .push(json!("listlevel"));
        doc["securities"]["metadata"]["listlevel"] = json!({"type": "int32"});

        let response = TabularResponse::from_json_block(&doc, SECURITIES_BLOCK).unwrap();
        let err = convert::<Security>(&response).unwrap_err();
        assert!(matches!(err, ConvertError::UnknownColumn { ref column, .. } if column == "listlevel"));
    }

    #[test]
    fn schema_is_built_once() {
        let a = Security::schema() as *const _;
        let b = Security::schema() as *const _;
        assert_eq!(a, b);
        assert_eq!(Security::schema().len(), 16);
    }
}
