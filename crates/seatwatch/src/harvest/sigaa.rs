//! Harvester for the SIGAA public class listing (`turmas/listar.jsf`).
//!
//! The listing is a JSF form:
//! 1. GET the form page to obtain the session cookie and `javax.faces.ViewState`
//! 2. POST the search form once per department
//! 3. Parse `table.listagem`: `tr.agrupador` rows carry `CODE - Name`, the
//!    rows below them are the sections of that subject

use std::sync::LazyLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use super::Harvester;
use crate::error::{Error, Result};
use crate::types::{fields, RawRecord};

const LISTING_URL: &str = "https://sigaa.unb.br/sigaa/public/turmas/listar.jsf";
const FORM_ID: &str = "formTurma";
const LEVEL_FIELD: &str = "formTurma:inputNivel";
const DEPARTMENT_FIELD: &str = "formTurma:inputDepto";
const YEAR_FIELD: &str = "formTurma:inputAno";
const PERIOD_FIELD: &str = "formTurma:inputPeriodo";
const VIEW_STATE_FIELD: &str = "javax.faces.ViewState";
const NO_RESULTS_MARKER: &str = "Nenhuma turma encontrada";

/// Configuration for the SIGAA harvester.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvesterConfig {
    pub listing_url: String,
    /// Teaching level, e.g. "G" for undergraduate.
    pub level: String,
    /// Department (unit) ids to search, one POST each.
    pub departments: Vec<String>,
    pub year: Option<u16>,
    pub period: Option<u8>,
    pub user_agent: String,
    pub request_timeout_secs: u64,
}

impl Default for HarvesterConfig {
    fn default() -> Self {
        Self {
            listing_url: LISTING_URL.to_string(),
            level: "G".to_string(),
            departments: Vec::new(),
            year: None,
            period: None,
            user_agent: concat!("seatwatch/", env!("CARGO_PKG_VERSION")).to_string(),
            request_timeout_secs: 60,
        }
    }
}

pub struct SigaaHarvester {
    config: HarvesterConfig,
    /// The session. `None` after release, rebuilt lazily.
    client: Option<Client>,
}

impl SigaaHarvester {
    pub fn new(config: HarvesterConfig) -> Result<Self> {
        Url::parse(&config.listing_url)
            .map_err(|e| Error::config(format!("invalid listing_url: {e}")))?;
        let client = build_client(&config)?;
        Ok(Self {
            config,
            client: Some(client),
        })
    }

    fn client(&mut self) -> Result<Client> {
        match &self.client {
            Some(client) => Ok(client.clone()),
            None => {
                let client = build_client(&self.config)?;
                self.client = Some(client.clone());
                Ok(client)
            }
        }
    }

    async fn fetch_department(&self, client: &Client, department: &str) -> Result<Vec<RawRecord>> {
        let form_page = client
            .get(&self.config.listing_url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::harvest(format!("GET listing form failed: {e}")))?
            .text()
            .await
            .map_err(|e| Error::harvest(format!("reading listing form failed: {e}")))?;

        let mut form = extract_form_fields(&form_page)?;
        form.push((LEVEL_FIELD.to_string(), self.config.level.clone()));
        form.push((DEPARTMENT_FIELD.to_string(), department.to_string()));
        if let Some(year) = self.config.year {
            form.push((YEAR_FIELD.to_string(), year.to_string()));
        }
        if let Some(period) = self.config.period {
            form.push((PERIOD_FIELD.to_string(), period.to_string()));
        }

        let results_page = client
            .post(&self.config.listing_url)
            .form(&form)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::harvest(format!("POST search for {department} failed: {e}")))?
            .text()
            .await
            .map_err(|e| Error::harvest(format!("reading results for {department} failed: {e}")))?;

        parse_listing(&results_page)
    }
}

fn build_client(config: &HarvesterConfig) -> Result<Client> {
    Client::builder()
        .cookie_store(true)
        .user_agent(&config.user_agent)
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .build()
        .map_err(|e| Error::harvest(format!("Failed to build HTTP client: {e}")))
}

#[async_trait]
impl Harvester for SigaaHarvester {
    async fn produce_snapshot(&mut self) -> Result<Vec<RawRecord>> {
        if self.config.departments.is_empty() {
            return Err(Error::harvest("no departments configured"));
        }

        let client = self.client()?;
        let start = Instant::now();
        let mut records = Vec::new();

        for department in &self.config.departments {
            let rows = self.fetch_department(&client, department).await?;
            debug!(department = %department, rows = rows.len(), "Department harvested");
            records.extend(rows);
        }

        info!(
            departments = self.config.departments.len(),
            rows = records.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Snapshot harvested"
        );
        Ok(records)
    }

    async fn recycle(&mut self) -> Result<()> {
        info!("Recycling SIGAA session");
        self.client = Some(build_client(&self.config)?);
        Ok(())
    }

    async fn release(&mut self) {
        if self.client.take().is_some() {
            info!("SIGAA session released");
        }
    }
}

static FORM_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(&format!("form#{FORM_ID}")).unwrap());
static HIDDEN_INPUT_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("input[type='hidden'][name]").unwrap());
static SUBMIT_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("input[type='submit'][name]").unwrap());
static TABLE_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("table.listagem").unwrap());
static HEADER_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("thead th").unwrap());
static ROW_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tbody > tr").unwrap());
static CELL_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("td").unwrap());

/// Collects the hidden inputs (including the ViewState) and the search
/// button of the listing form.
fn extract_form_fields(html: &str) -> Result<Vec<(String, String)>> {
    let document = Html::parse_document(html);
    let form = document
        .select(&FORM_SELECTOR)
        .next()
        .ok_or_else(|| Error::harvest(format!("form #{FORM_ID} not found on listing page")))?;

    let mut fields: Vec<(String, String)> = form
        .select(&HIDDEN_INPUT_SELECTOR)
        .filter_map(|input| {
            let name = input.value().attr("name")?;
            let value = input.value().attr("value").unwrap_or_default();
            Some((name.to_string(), value.to_string()))
        })
        .collect();

    if !fields.iter().any(|(name, _)| name == VIEW_STATE_FIELD) {
        return Err(Error::harvest("listing form has no javax.faces.ViewState"));
    }

    if let Some(submit) = form.select(&SUBMIT_SELECTOR).next() {
        if let Some(name) = submit.value().attr("name") {
            let value = submit.value().attr("value").unwrap_or("Buscar");
            fields.push((name.to_string(), value.to_string()));
        }
    }

    Ok(fields)
}

/// Maps a column header of the results table to a raw record field.
fn header_field(label: &str) -> Option<&'static str> {
    let label = label.to_lowercase();
    let field = if label.contains("ofertad") {
        fields::OFFERED
    } else if label.contains("ocupad") {
        fields::OCCUPIED
    } else if label.contains("dispon") {
        fields::AVAILABLE
    } else if label.contains("docente") || label.contains("professor") {
        fields::INSTRUCTOR
    } else if label.contains("horário") || label.contains("horario") {
        fields::SCHEDULE
    } else if label.contains("ano") || label.contains("período") || label.contains("periodo") {
        fields::TERM
    } else if label.contains("local") {
        fields::LOCATION
    } else if label.contains("código") || label.contains("codigo") {
        fields::SUBJECT_CODE
    } else if label.contains("componente") || label.contains("matéria") || label.contains("disciplina")
    {
        fields::SUBJECT_NAME
    } else if label.contains("turma") || label.starts_with('n') {
        fields::SECTION
    } else {
        return None;
    };
    Some(field)
}

fn cell_text(element: &ElementRef<'_>) -> String {
    element.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Splits an `agrupador` row label such as `FGA0001 - CÁLCULO 1`.
fn parse_group_label(text: &str) -> Option<(String, String)> {
    let (code, name) = match text.split_once(" - ") {
        Some((code, name)) => (code.trim(), name.trim()),
        None => (text.trim(), ""),
    };
    if code.is_empty() || code.contains(' ') {
        return None;
    }
    Some((code.to_string(), name.to_string()))
}

/// Parses a results page into raw records.
///
/// A page that says no classes were found yields an empty list; a page with
/// neither that message nor a results table is a harvest failure (the
/// portal layout probably changed).
pub fn parse_listing(html: &str) -> Result<Vec<RawRecord>> {
    let document = Html::parse_document(html);

    let Some(table) = document.select(&TABLE_SELECTOR).next() else {
        if html.contains(NO_RESULTS_MARKER) {
            return Ok(Vec::new());
        }
        return Err(Error::harvest("results table `table.listagem` not found"));
    };

    let headers: Vec<Option<&'static str>> = table
        .select(&HEADER_SELECTOR)
        .map(|th| header_field(&cell_text(&th)))
        .collect();
    if headers.iter().all(Option::is_none) {
        return Err(Error::harvest("results table has no recognizable headers"));
    }

    let mut records = Vec::new();
    let mut current_subject: Option<(String, String)> = None;

    for row in table.select(&ROW_SELECTOR) {
        let class = row.value().attr("class").unwrap_or_default();
        if class.contains("agrupador") {
            current_subject = parse_group_label(&cell_text(&row));
            if current_subject.is_none() {
                warn!(label = %cell_text(&row), "Unrecognized subject group label");
            }
            continue;
        }

        let cells: Vec<String> = row.select(&CELL_SELECTOR).map(|td| cell_text(&td)).collect();
        if cells.len() < 2 {
            continue;
        }

        let mut record = RawRecord::new();
        if let Some((code, name)) = &current_subject {
            record.insert(fields::SUBJECT_CODE.to_string(), code.clone());
            record.insert(fields::SUBJECT_NAME.to_string(), name.clone());
        }
        for (field, value) in headers.iter().zip(cells) {
            if let Some(field) = field {
                record.insert(field.to_string(), value);
            }
        }
        records.push(record);
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESULTS_HTML: &str = r#"
        <html><body>
        <table class="listagem">
          <thead><tr>
            <th>Turma</th><th>Ano-Período</th><th>Docente</th><th>Horário</th>
            <th>Qtde Vagas Ofertadas</th><th>Qtde Vagas Ocupadas</th><th>Local</th>
          </tr></thead>
          <tbody>
            <tr class="agrupador"><td colspan="7"><span>FGA0001 - CÁLCULO 1</span></td></tr>
            <tr class="linhaPar">
              <td>01</td><td>2025.2</td><td>MARIA SILVA (60h)</td><td>35T23</td>
              <td>40</td><td>38</td><td>FGA - S1</td>
            </tr>
            <tr class="linhaImpar">
              <td>02</td><td>2025.2</td><td>JOÃO
                  SOUZA</td><td>24M12</td><td>30</td><td>30</td><td>FGA - I3</td>
            </tr>
            <tr class="agrupador"><td colspan="7">FCTE0099 - ESTRUTURAS</td></tr>
            <tr class="linhaPar">
              <td>01</td><td>2025.2</td><td>A DEFINIR</td><td>6N12</td>
              <td>--</td><td>0</td><td>FGA - S5</td>
            </tr>
          </tbody>
        </table>
        </body></html>"#;

    #[test]
    fn test_parse_listing_groups_rows_by_subject() {
        let records = parse_listing(RESULTS_HTML).unwrap();
        assert_eq!(records.len(), 3);

        assert_eq!(records[0][fields::SUBJECT_CODE], "FGA0001");
        assert_eq!(records[0][fields::SUBJECT_NAME], "CÁLCULO 1");
        assert_eq!(records[0][fields::SECTION], "01");
        assert_eq!(records[0][fields::TERM], "2025.2");
        assert_eq!(records[0][fields::OFFERED], "40");
        assert_eq!(records[0][fields::OCCUPIED], "38");
        assert_eq!(records[0][fields::LOCATION], "FGA - S1");

        assert_eq!(records[1][fields::INSTRUCTOR], "JOÃO SOUZA");
        assert_eq!(records[2][fields::SUBJECT_CODE], "FCTE0099");
        // Left raw; the normalizer rejects it.
        assert_eq!(records[2][fields::OFFERED], "--");
    }

    #[test]
    fn test_parse_listing_empty_and_broken_pages() {
        let empty = "<html><body><p>Nenhuma turma encontrada</p></body></html>";
        assert!(parse_listing(empty).unwrap().is_empty());

        let changed = "<html><body><div id='novo-layout'></div></body></html>";
        assert!(matches!(
            parse_listing(changed),
            Err(Error::HarvestFailure { .. })
        ));
    }

    #[test]
    fn test_extract_form_fields() {
        let html = r#"
            <form id="formTurma" method="post">
              <input type="hidden" name="formTurma" value="formTurma"/>
              <input type="hidden" name="javax.faces.ViewState" value="j_id3"/>
              <select name="formTurma:inputDepto"></select>
              <input type="submit" name="formTurma:j_id_jsp_1" value="Buscar"/>
            </form>"#;
        let fields = extract_form_fields(html).unwrap();
        assert!(fields.contains(&("javax.faces.ViewState".to_string(), "j_id3".to_string())));
        assert!(fields.contains(&("formTurma:j_id_jsp_1".to_string(), "Buscar".to_string())));

        let no_state = r#"<form id="formTurma"><input type="hidden" name="a" value="b"/></form>"#;
        assert!(extract_form_fields(no_state).is_err());
    }

    #[test]
    fn test_header_mapping() {
        assert_eq!(header_field("Qtde Vagas Ofertadas"), Some(fields::OFFERED));
        assert_eq!(header_field("Qtde Vagas Ocupadas"), Some(fields::OCCUPIED));
        assert_eq!(header_field("Ano-Período"), Some(fields::TERM));
        assert_eq!(header_field("Nº"), Some(fields::SECTION));
        assert_eq!(header_field("Horário"), Some(fields::SCHEDULE));
        assert_eq!(header_field(""), None);
    }
}
