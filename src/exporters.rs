//! Plain export formats for the REST listing path: JSON, CSV, and line-per-IP
//! text. The STIX form lives in `models::stix` and is served over TAXII.

use serde_json::json;

use crate::models::Indicator;

pub fn to_json(indicators: &[Indicator]) -> String {
    serde_json::to_string_pretty(&json!({
        "total": indicators.len(),
        "indicators": indicators,
    }))
    .unwrap_or_else(|_| "{}".to_string())
}

pub fn to_csv(indicators: &[Indicator]) -> String {
    let mut out = String::from(
        "ip,final_confidence,local_confidence,external_confidence,last_reported_at,country_code,isp,labels,categories\n",
    );
    for indicator in indicators {
        let geo = indicator.geo.as_ref();
        out.push_str(&format!(
            "{},{},{},{},{},{},{},{},{}\n",
            indicator.ip,
            indicator.final_confidence,
            indicator.local_confidence.map_or(String::new(), |c| c.to_string()),
            indicator.external_confidence.map_or(String::new(), |c| c.to_string()),
            indicator.last_reported_at.to_rfc3339(),
            geo.map_or("", |g| g.country_code.as_str()),
            csv_field(geo.and_then(|g| g.isp.as_deref()).unwrap_or("")),
            indicator.labels.join("|"),
            indicator.categories.join("|"),
        ));
    }
    out
}

/// One address per line; metadata appended as a trailing comment.
pub fn to_txt(indicators: &[Indicator], include_metadata: bool) -> String {
    let mut lines = Vec::with_capacity(indicators.len());
    for indicator in indicators {
        if include_metadata {
            let mut line =
                format!("{} # Confidence: {}%", indicator.ip, indicator.final_confidence);
            if let Some(geo) = &indicator.geo {
                line.push_str(&format!(" Country: {}", geo.country_code));
            }
            lines.push(line);
        } else {
            lines.push(indicator.ip.clone());
        }
    }
    lines.join("\n")
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
