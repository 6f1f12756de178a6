//! Prompts for the three vision-classifier stages.
//!
//! Every prompt lives here so the wording can change without touching the
//! retry or parsing logic in [`crate::classifier`], and so unit tests can
//! inspect the contracts without a live model.
//!
//! Each prompt names the exact JSON shape the parser in
//! [`crate::classifier`] deserialises. Keep the two in step.

/// Stage A: classify the document and list its sections.
pub const SECTIONS_PROMPT: &str = r#"You are a document analysis expert. Analyze this automotive offer/specification document.

Identify all sections and classify the document type.

Output JSON with this exact schema:
{
  "document_type": "offer" | "specification" | "price_list" | "other",
  "sections": [
    {
      "id": "unique_string",
      "title": "Section title as it appears",
      "category": "vehicle_info" | "equipment" | "pricing" | "financing" | "trade_in" | "contact" | "legal" | "other",
      "page_range": [start_page, end_page],
      "confidence": 0.0-1.0
    }
  ]
}

Categories guide:
- vehicle_info: Brand, model, specs, powertrain
- equipment: Options, packages, features
- pricing: Prices, fees (NOT discounts)
- financing: Leasing, loans, monthly payments
- trade_in: Vehicle exchange offers
- contact: Dealer info, salesperson, contact details
- legal: RODO, terms, legal notices

Pages are numbered from 1 in the order the images are attached.
Be thorough - list ALL sections found in the document.
Output ONLY the JSON object."#;

/// Stage B: locate sensitive regions.
pub const FINDINGS_PROMPT: &str = r#"Detect all sensitive information in this automotive document that should be anonymized.

Categories to detect:
- personal: Names, signatures, personal identifiers
- contact: Phone numbers, email addresses, physical addresses
- dealer: Dealer/salon name, logo, NIP/REGON, company identifiers
- discount: Rabaty, promocje, individual pricing conditions, upusty
- finance: Leasing terms, monthly payments, financing details
- trade_in: Vehicle valuation, trade-in offers
- legal: RODO notices, legal disclaimers
- notes: Handwritten notes, seller comments

For each finding, provide bbox coordinates as percentages of the page (0-100),
measured from the TOP-LEFT corner of the page image.

Output JSON:
{
  "findings": [
    {
      "id": "finding_001",
      "category": "personal" | "contact" | "dealer" | "discount" | "finance" | "trade_in" | "legal" | "notes",
      "label": "Short label, e.g. 'Email', 'Dealer Name', 'Discount %'",
      "value_preview": "First 20 characters only",
      "page": 1,
      "bbox": {"x": 10, "y": 20, "w": 30, "h": 5},
      "confidence": 0.95,
      "suggested_action": "remove" | "mask" | "keep"
    }
  ]
}

Suggested action guide:
- remove: Personal data, dealer names, discounts (HIGH risk)
- mask: Contact info, some financial details (MEDIUM risk)
- keep: Legal notices, general terms (LOW risk)

Pages are numbered from 1 in the order the images are attached.
Be exhaustive - find ALL sensitive items.
Output ONLY the JSON object."#;

/// Stage C: structured extraction (unify mode only).
pub const EXTRACTION_PROMPT: &str = r#"Extract structured vehicle data from this automotive offer document.

Output a JSON object with these top-level keys (omit a field or use null when it cannot be determined):

"vehicle": brand, model, version, year, vin, body_type (sedan/hatchback/SUV/etc), color, mileage_km (used vehicles)

"powertrain": engine_type (ICE, HEV, PHEV or BEV), engine_name, fuel_type, displacement_cc,
  power_hp, power_kw, torque_nm, transmission (manual/automatic), drivetrain (FWD/RWD/AWD),
  battery_kwh (EV/PHEV), range_km (WLTP)

"equipment": lists of strings - packages, options, standard_features, safety, comfort,
  multimedia, exterior, interior

"dimensions": length_mm, width_mm, height_mm, wheelbase_mm, boot_capacity_l, curb_weight_kg, gross_weight_kg

"pricing": list_price and/or final_price as numbers, currency (default PLN), tax_type.
  Do NOT include discounts. Always set "discounts_removed": true.

"availability": status (available/incoming/sold), delivery_time,
  location_general (city or region only, never the dealer name)

"confidence": your overall confidence 0.0-1.0

"notes": anything important that fits nowhere else, without personal or dealer data

Only include a field when it was found with reasonable confidence.
Output ONLY the JSON object."#;

/// User-turn text that accompanies the page images for stage C.
pub fn extraction_context(filename: &str, pages: usize) -> String {
    format!("Source file: {filename}\nAttached pages: {pages}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompts_name_their_json_keys() {
        assert!(SECTIONS_PROMPT.contains("\"document_type\""));
        assert!(FINDINGS_PROMPT.contains("\"suggested_action\""));
        assert!(FINDINGS_PROMPT.contains("TOP-LEFT"));
        assert!(EXTRACTION_PROMPT.contains("discounts_removed"));
    }

    #[test]
    fn extraction_context_mentions_file() {
        let ctx = extraction_context("oferta.pdf", 4);
        assert!(ctx.contains("oferta.pdf"));
        assert!(ctx.contains('4'));
    }
}
