//! UWS and VOSI document serialization

use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::escape::escape;
use tapir_core::query::params::TapParams;
use tapir_core::{Job, ServiceConfig, TableDef};

const UWS_NS: &str = "http://www.ivoa.net/xml/UWS/v1.0";
const XLINK_NS: &str = "http://www.w3.org/1999/xlink";
const XSI_NS: &str = "http://www.w3.org/2001/XMLSchema-instance";

fn stamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Full UWS job description
pub fn job_document(job: &Job) -> String {
    let mut out = String::with_capacity(1024);
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str(&format!(
        "<uws:job xmlns:uws=\"{}\" xmlns:xlink=\"{}\" xmlns:xsi=\"{}\">\n",
        UWS_NS, XLINK_NS, XSI_NS
    ));

    out.push_str(&format!("<uws:jobId>{}</uws:jobId>\n", escape(&job.id)));
    match &job.owner {
        Some(owner) => out.push_str(&format!("<uws:ownerId>{}</uws:ownerId>\n", escape(owner))),
        None => out.push_str("<uws:ownerId xsi:nil=\"true\"/>\n"),
    }
    out.push_str(&format!("<uws:phase>{}</uws:phase>\n", job.phase.as_str()));
    match job.quote {
        Some(quote) => out.push_str(&format!("<uws:quote>{}</uws:quote>\n", stamp(quote))),
        None => out.push_str("<uws:quote xsi:nil=\"true\"/>\n"),
    }
    match job.start_time {
        Some(start) => out.push_str(&format!("<uws:startTime>{}</uws:startTime>\n", stamp(start))),
        None => out.push_str("<uws:startTime xsi:nil=\"true\"/>\n"),
    }
    match job.end_time {
        Some(end) => out.push_str(&format!("<uws:endTime>{}</uws:endTime>\n", stamp(end))),
        None => out.push_str("<uws:endTime xsi:nil=\"true\"/>\n"),
    }
    out.push_str(&format!(
        "<uws:executionDuration>{}</uws:executionDuration>\n",
        job.execution_duration
    ));
    out.push_str(&format!(
        "<uws:destruction>{}</uws:destruction>\n",
        stamp(job.destruction_time)
    ));

    out.push_str(&parameters_fragment(&job.params));
    out.push_str(&results_fragment(job));

    if let Some(summary) = &job.error_summary {
        out.push_str(&format!(
            "<uws:errorSummary type=\"{}\" hasDetail=\"{}\">\n<uws:message>{}</uws:message>\n</uws:errorSummary>\n",
            summary.error_type,
            summary.details_ref.is_some(),
            escape(&summary.message)
        ));
    }

    if let Some(progression) = job.progression {
        out.push_str(&format!(
            "<uws:jobInfo><progression>{}</progression></uws:jobInfo>\n",
            progression
        ));
    }

    out.push_str("</uws:job>\n");
    out
}

/// The `<uws:parameters>` element, shared by the job document and the
/// parameters endpoint
pub fn parameters_fragment(params: &TapParams) -> String {
    let mut out = String::from("<uws:parameters>\n");
    let mut push = |name: &str, value: &str| {
        out.push_str(&format!(
            "<uws:parameter id=\"{}\">{}</uws:parameter>\n",
            escape(name),
            escape(value)
        ));
    };

    if let Some(v) = &params.request {
        push("REQUEST", v);
    }
    if let Some(v) = &params.lang {
        push("LANG", v);
    }
    if let Some(v) = &params.version {
        push("VERSION", v);
    }
    if let Some(v) = &params.format {
        push("FORMAT", v);
    }
    if let Some(v) = params.max_rec {
        push("MAXREC", &v.to_string());
    }
    if let Some(v) = &params.query {
        push("QUERY", v);
    }
    if !params.uploads.is_empty() {
        let names: Vec<&str> = params.uploads.iter().map(|u| u.name.as_str()).collect();
        push("UPLOAD", &names.join(";"));
    }
    for (name, value) in &params.extra {
        push(name, value);
    }

    out.push_str("</uws:parameters>\n");
    out
}

/// Standalone parameters document
pub fn parameters_document(params: &TapParams) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{}",
        parameters_fragment(params).replacen(
            "<uws:parameters>",
            &format!("<uws:parameters xmlns:uws=\"{}\">", UWS_NS),
            1
        )
    )
}

fn results_fragment(job: &Job) -> String {
    let mut out = String::from("<uws:results>\n");
    for result in &job.results {
        out.push_str(&format!(
            "<uws:result id=\"{}\" xlink:href=\"{}\" mime-type=\"{}\"{}/>\n",
            escape(&result.id),
            escape(&result.href),
            escape(&result.mime_type),
            match result.size {
                Some(size) => format!(" size=\"{}\"", size),
                None => String::new(),
            }
        ));
    }
    out.push_str("</uws:results>\n");
    out
}

/// Standalone results document
pub fn results_document(job: &Job) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{}",
        results_fragment(job).replacen(
            "<uws:results>",
            &format!(
                "<uws:results xmlns:uws=\"{}\" xmlns:xlink=\"{}\">",
                UWS_NS, XLINK_NS
            ),
            1
        )
    )
}

/// Job list with one jobref per visible job
pub fn job_list_document(list_name: &str, jobs: &[Job]) -> String {
    let mut out = String::with_capacity(512);
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str(&format!(
        "<uws:jobs xmlns:uws=\"{}\" xmlns:xlink=\"{}\">\n",
        UWS_NS, XLINK_NS
    ));
    for job in jobs {
        out.push_str(&format!(
            "<uws:jobref id=\"{}\" xlink:href=\"/{}/{}\">\n<uws:phase>{}</uws:phase>\n</uws:jobref>\n",
            escape(&job.id),
            escape(list_name),
            escape(&job.id),
            job.phase.as_str()
        ));
    }
    out.push_str("</uws:jobs>\n");
    out
}

/// VOTable-shaped error document
pub fn error_document(message: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <VOTABLE version=\"1.3\" xmlns=\"http://www.ivoa.net/xml/VOTable/v1.3\">\n\
         <RESOURCE type=\"results\">\n\
         <INFO name=\"QUERY_STATUS\" value=\"ERROR\">{}</INFO>\n\
         </RESOURCE>\n</VOTABLE>\n",
        escape(message)
    )
}

/// VOSI availability document
pub fn availability_document(available: bool, note: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <vosi:availability xmlns:vosi=\"http://www.ivoa.net/xml/VOSIAvailability/v1.0\">\n\
         <vosi:available>{}</vosi:available>\n\
         <vosi:note>{}</vosi:note>\n\
         </vosi:availability>\n",
        available,
        escape(note)
    )
}

/// VOSI capabilities document with the TAP capability block
pub fn capabilities_document(config: &ServiceConfig, formats: &[(String, String)]) -> String {
    let mut out = String::with_capacity(1024);
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str(
        "<vosi:capabilities xmlns:vosi=\"http://www.ivoa.net/xml/VOSICapabilities/v1.0\" \
         xmlns:tr=\"http://www.ivoa.net/xml/TAPRegExt/v1.0\">\n",
    );
    out.push_str("<capability standardID=\"ivo://ivoa.net/std/TAP\" xsi:type=\"tr:TableAccess\" \
         xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\">\n");
    out.push_str("<interface role=\"std\"><accessURL use=\"base\">/</accessURL></interface>\n");
    out.push_str("<language><name>ADQL</name><version>2.0</version></language>\n");

    for (alias, mime) in formats {
        out.push_str(&format!(
            "<outputFormat><mime>{}</mime><alias>{}</alias></outputFormat>\n",
            escape(mime),
            escape(alias)
        ));
    }

    out.push_str(&format!(
        "<retentionPeriod><default>{}</default></retentionPeriod>\n",
        config.default_destruction_interval
    ));
    out.push_str(&format!(
        "<executionDuration><default>{}</default></executionDuration>\n",
        config.default_execution_duration
    ));
    if config.max_rec >= 0 {
        out.push_str(&format!(
            "<outputLimit><default unit=\"row\">{}</default><hard unit=\"row\">{}</hard></outputLimit>\n",
            config.default_max_rec, config.max_rec
        ));
    }
    if config.uploads_enabled {
        out.push_str("<uploadMethod ivo-id=\"ivo://ivoa.net/std/TAPRegExt#upload-inline\"/>\n");
        out.push_str("<uploadMethod ivo-id=\"ivo://ivoa.net/std/TAPRegExt#upload-http\"/>\n");
    }

    out.push_str("</capability>\n</vosi:capabilities>\n");
    out
}

/// VOSI tableset document, grouped by schema
pub fn tables_document(tables: &[TableDef]) -> String {
    let mut out = String::with_capacity(1024);
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str(
        "<vosi:tableset xmlns:vosi=\"http://www.ivoa.net/xml/VOSITables/v1.0\">\n",
    );

    let mut schemas: Vec<&str> = tables.iter().map(|t| t.schema.as_str()).collect();
    schemas.sort();
    schemas.dedup();

    for schema in schemas {
        out.push_str(&format!("<schema>\n<name>{}</name>\n", escape(schema)));
        for table in tables.iter().filter(|t| t.schema == schema) {
            out.push_str(&format!("<table>\n<name>{}</name>\n", escape(&table.full_name())));
            if let Some(description) = &table.description {
                out.push_str(&format!(
                    "<description>{}</description>\n",
                    escape(description)
                ));
            }
            for column in &table.columns {
                out.push_str(&format!(
                    "<column>\n<name>{}</name>\n<dataType>{}</dataType>\n",
                    escape(&column.name),
                    column.datatype.votable_name()
                ));
                if let Some(unit) = &column.unit {
                    out.push_str(&format!("<unit>{}</unit>\n", escape(unit)));
                }
                if let Some(description) = &column.description {
                    out.push_str(&format!(
                        "<description>{}</description>\n",
                        escape(description)
                    ));
                }
                out.push_str("</column>\n");
            }
            out.push_str("</table>\n");
        }
        out.push_str("</schema>\n");
    }

    out.push_str("</vosi:tableset>\n");
    out
}
